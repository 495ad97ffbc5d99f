//! Whole-engine frame loop scenarios on the in-memory device.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;
use cinder_core::{EngineConfig, SurfaceSize};
use cinder_gpu::{
    AcquireOutcome, ClearPasses, DescriptorSetLayoutBuilder, Engine, FrameOutcome, FramePasses,
    GpuDevice, GpuError, MockDevice, MockEvent, PassContext, PresentOutcome, Result, SkipReason,
};

const CLEAR: [f32; 4] = [0.1, 0.2, 0.3, 1.0];

fn engine(width: u32, height: u32) -> Engine<MockDevice, ClearPasses> {
    Engine::init(
        MockDevice::new(),
        SurfaceSize::new(width, height),
        EngineConfig::default(),
        ClearPasses::new(CLEAR),
    )
    .unwrap()
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn cold_start_presents_every_update() {
    let mut engine = engine(800, 600);

    let mut slots = Vec::new();
    for expected in 0..5 {
        match engine.update().unwrap() {
            FrameOutcome::Presented {
                frame_number, slot, ..
            } => {
                assert_eq!(frame_number, expected);
                slots.push(slot);
            }
            other => panic!("frame {expected} not presented: {other:?}"),
        }
    }

    assert_eq!(engine.frame_number(), 5);
    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert!(engine.device().violations().is_empty());
    engine.shutdown().unwrap();
}

#[test]
fn each_slot_fence_is_waited_before_it_is_reset() {
    let mut engine = engine(800, 600);
    let fences: Vec<_> = (0..2)
        .map(|i| engine.frames().get(i).unwrap().sync.in_flight)
        .collect();
    engine.device().clear_events();

    for _ in 0..4 {
        engine.update().unwrap();
    }

    let events = engine.device().events();
    let waits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MockEvent::WaitFence { fence } => Some(*fence),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![fences[0], fences[1], fences[0], fences[1]]);

    for fence in &fences {
        let mut waited = false;
        for event in &events {
            match event {
                MockEvent::WaitFence { fence: f } if f == fence => waited = true,
                MockEvent::ResetFence { fence: f } if f == fence => {
                    assert!(waited, "fence {fence:?} reset before it was waited on");
                    waited = false;
                }
                _ => {}
            }
        }
    }
    engine.shutdown().unwrap();
}

#[test]
fn resize_rebuilds_to_the_new_size() {
    let mut engine = engine(800, 600);
    engine.update().unwrap();

    engine.notify_resize(1024, 768);
    assert!(engine.pending_resize());
    engine.device().clear_events();
    assert!(engine.update().unwrap().is_presented());

    assert_eq!(engine.surface_extent(), Some(extent(1024, 768)));
    assert_eq!(engine.draw_extent(), Some(extent(1024, 768)));
    assert!(!engine.pending_resize());

    let events = engine.device().events();
    assert_eq!(events.first(), Some(&MockEvent::WaitIdle));
    assert!(events.iter().any(|e| matches!(
        e,
        MockEvent::CreateSwapchain { extent: created, .. } if *created == extent(1024, 768)
    )));
    let blits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MockEvent::Blit { dst_extent, .. } => Some(*dst_extent),
            _ => None,
        })
        .collect();
    assert_eq!(blits, vec![extent(1024, 768)]);
    assert_eq!(engine.device().swapchain_count(), 1);
    engine.shutdown().unwrap();
}

#[test]
fn out_of_date_acquire_skips_without_resetting_the_fence() {
    let mut engine = engine(800, 600);
    engine.update().unwrap();
    engine.device().push_acquire_outcome(AcquireOutcome::OutOfDate);
    engine.device().clear_events();

    let outcome = engine.update().unwrap();

    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate));
    assert_eq!(engine.frame_number(), 1);
    assert!(engine.pending_resize());
    let device = engine.device();
    assert_eq!(device.count_events(|e| matches!(e, MockEvent::ResetFence { .. })), 0);
    assert_eq!(device.count_events(|e| matches!(e, MockEvent::Submit { .. })), 0);
    let fence = engine.frames().get(1).unwrap().sync.in_flight;
    assert!(device.fence_signaled(fence));

    // The same slot is reused once the surface is rebuilt.
    match engine.update().unwrap() {
        FrameOutcome::Presented {
            frame_number, slot, ..
        } => {
            assert_eq!(frame_number, 1);
            assert_eq!(slot, 1);
        }
        other => panic!("expected a presented frame, got {other:?}"),
    }
    assert!(engine.device().violations().is_empty());
    engine.shutdown().unwrap();
}

#[test]
fn stale_present_schedules_a_rebuild() {
    let mut engine = engine(800, 600);
    engine.device().push_present_outcome(PresentOutcome::Suboptimal);

    assert!(engine.update().unwrap().is_presented());
    assert!(engine.pending_resize());

    engine.device().clear_events();
    engine.update().unwrap();
    assert_eq!(
        engine
            .device()
            .count_events(|e| matches!(e, MockEvent::CreateSwapchain { .. })),
        1
    );
    engine.shutdown().unwrap();
}

#[test]
fn minimised_window_skips_frames_until_restored() {
    let mut engine = engine(800, 600);
    engine.update().unwrap();

    engine.notify_resize(0, 0);
    engine.device().clear_events();
    for _ in 0..3 {
        assert_eq!(
            engine.update().unwrap(),
            FrameOutcome::Skipped(SkipReason::Minimized)
        );
    }
    assert!(engine.device().events().is_empty());
    assert_eq!(engine.frame_number(), 1);

    engine.notify_resize(800, 600);
    assert!(engine.update().unwrap().is_presented());
    assert_eq!(engine.surface_extent(), Some(extent(800, 600)));
    engine.shutdown().unwrap();
}

#[test]
fn starting_minimised_builds_on_first_visible_update() {
    let mut engine = engine(0, 0);
    assert!(engine.surface_extent().is_none());
    assert_eq!(
        engine.update().unwrap(),
        FrameOutcome::Skipped(SkipReason::Minimized)
    );

    engine.notify_resize(640, 480);
    assert!(engine.update().unwrap().is_presented());
    assert_eq!(engine.surface_extent(), Some(extent(640, 480)));
    engine.shutdown().unwrap();
}

#[test]
fn hung_gpu_surfaces_a_fence_timeout() {
    let mut engine = engine(800, 600);
    engine.device().set_fences_hang(true);

    let err = engine.update().unwrap_err();
    assert!(matches!(err, GpuError::FenceTimeout { .. }), "{err}");
    assert_eq!(engine.frame_number(), 0);
    assert!(engine.is_halted());

    engine.device().set_fences_hang(false);
    assert!(matches!(engine.update(), Err(GpuError::Halted)));
    engine.shutdown().unwrap();
}

#[test]
fn frame_deletions_run_newest_first_when_the_slot_returns() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut engine = engine(800, 600);
    engine.update().unwrap();

    for name in ["first", "second"] {
        let log = Rc::clone(&log);
        engine.defer_frame_deletion(move |_| log.borrow_mut().push(name));
    }

    engine.update().unwrap();
    assert!(log.borrow().is_empty(), "ran before its slot came around");

    engine.update().unwrap();
    assert_eq!(*log.borrow(), vec!["second", "first"]);
    engine.shutdown().unwrap();
}

#[test]
fn shutdown_flushes_frame_queues_before_the_global_queue() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut engine = engine(800, 600);
    engine.update().unwrap();

    let buffer = engine
        .upload_buffer(&[7; 64], vk::BufferUsageFlags::STORAGE_BUFFER, "scene")
        .unwrap();
    {
        let log = Rc::clone(&log);
        engine.defer_global_deletion(move |device: &MockDevice| {
            let mut buffer = buffer;
            device.destroy_buffer(&mut buffer).unwrap();
            log.borrow_mut().push("global");
        });
    }
    {
        let log = Rc::clone(&log);
        engine.defer_frame_deletion(move |_| log.borrow_mut().push("frame"));
    }

    engine.shutdown().unwrap();

    assert_eq!(*log.borrow(), vec!["frame", "global"]);
    assert!(engine.is_shut_down());
    assert_eq!(engine.device().live_objects(), 0);
    assert!(engine.device().violations().is_empty());

    // Idempotent.
    engine.shutdown().unwrap();
}

#[test]
fn immediate_uploads_are_visible_on_return() {
    let mut engine = engine(800, 600);
    let bytes: Vec<u8> = (0..=255).collect();

    let mut buffer = engine
        .upload_buffer(&bytes, vk::BufferUsageFlags::STORAGE_BUFFER, "lut")
        .unwrap();

    assert_eq!(engine.device().buffer_contents(&buffer), Some(bytes));
    engine.device().destroy_buffer(&mut buffer).unwrap();
    engine.shutdown().unwrap();
    assert_eq!(engine.device().live_objects(), 0);
}

/// Allocates a fixed number of sets from the frame allocator each frame.
struct DescriptorHeavy {
    layout: vk::DescriptorSetLayout,
    sets_per_frame: usize,
}

impl FramePasses<MockDevice> for DescriptorHeavy {
    fn background(&mut self, ctx: &mut PassContext<'_, MockDevice>) -> Result<()> {
        for _ in 0..self.sets_per_frame {
            ctx.allocate_set(self.layout)?;
        }
        Ok(())
    }
}

#[test]
fn frame_descriptor_pools_grow_then_recycle() {
    let mut engine = Engine::init(
        MockDevice::new(),
        SurfaceSize::new(320, 240),
        EngineConfig::default()
            .with_frames_in_flight(1)
            .with_frame_descriptor_sets(2),
        DescriptorHeavy {
            layout: vk::DescriptorSetLayout::null(),
            sets_per_frame: 5,
        },
    )
    .unwrap();
    let layout = DescriptorSetLayoutBuilder::new()
        .storage_image(0, vk::ShaderStageFlags::COMPUTE)
        .build(engine.device())
        .unwrap();
    engine.passes_mut().layout = layout;

    engine.device().clear_events();
    engine.update().unwrap();
    let created = |engine: &Engine<MockDevice, DescriptorHeavy>| {
        engine
            .device()
            .count_events(|e| matches!(e, MockEvent::CreateDescriptorPool { .. }))
    };
    assert_eq!(created(&engine), 1);
    let pools_after_growth = engine.device().descriptor_pool_count();

    for _ in 0..3 {
        engine.update().unwrap();
    }
    assert_eq!(created(&engine), 1, "cleared pools were not reused");
    assert_eq!(engine.device().descriptor_pool_count(), pools_after_growth);

    engine.device().destroy_descriptor_set_layout(layout);
    engine.shutdown().unwrap();
    assert_eq!(engine.device().live_objects(), 0);
}

#[test]
fn exhausted_descriptor_pools_halt_the_engine() {
    let mut engine = Engine::init(
        MockDevice::new(),
        SurfaceSize::new(320, 240),
        EngineConfig::default(),
        DescriptorHeavy {
            layout: vk::DescriptorSetLayout::null(),
            sets_per_frame: 1,
        },
    )
    .unwrap();
    let layout = DescriptorSetLayoutBuilder::new()
        .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
        .build(engine.device())
        .unwrap();
    engine.passes_mut().layout = layout;
    assert!(engine.update().unwrap().is_presented());

    engine
        .device()
        .set_descriptor_failure(Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
    let err = engine.update().unwrap_err();
    assert!(
        matches!(err, GpuError::DescriptorPoolExhausted { attempts: 2 }),
        "{err}"
    );
    assert!(err.is_fatal());
    assert!(engine.is_halted());

    engine.device().set_descriptor_failure(None);
    assert!(matches!(engine.update(), Err(GpuError::Halted)));
    assert_eq!(engine.frame_number(), 1);

    engine.device().destroy_descriptor_set_layout(layout);
    engine.shutdown().unwrap();
    assert_eq!(engine.device().live_objects(), 0);
}

#[test]
fn global_sets_survive_frames() {
    let mut engine = engine(800, 600);
    let global_sets = engine.config().global_descriptor_sets;
    let global_pools: Vec<_> = engine
        .device()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MockEvent::CreateDescriptorPool { pool, max_sets } if max_sets == global_sets => {
                Some(pool)
            }
            _ => None,
        })
        .collect();
    assert_eq!(global_pools.len(), 1);

    let layout = DescriptorSetLayoutBuilder::new()
        .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
        .build(engine.device())
        .unwrap();
    let set = engine.allocate_global_set(layout).unwrap();
    assert_ne!(set, vk::DescriptorSet::null());

    for _ in 0..4 {
        engine.update().unwrap();
    }
    let resets = engine.device().count_events(|e| {
        matches!(e, MockEvent::ResetDescriptorPool { pool } if *pool == global_pools[0])
    });
    assert_eq!(resets, 0);
    assert!(engine.device().count_events(|e| matches!(e, MockEvent::ResetDescriptorPool { .. })) > 0);

    engine.device().destroy_descriptor_set_layout(layout);
    engine.shutdown().unwrap();
}

//! Capture manager tests.
//!
//! These drive whole ticks against a manually completed readback source and a
//! mailbox transport, covering cadence, single in-flight capture, draining,
//! emission, background inference, and server responses.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use capture_protocol::Pixel;
use emitter::{ChannelReceiver, OutboundEvent, channel_transport};
use readback::{ManualReadbackController, ManualReadbackSource, ReadbackSink, RenderThreadConfig, RenderThreadSource};
use serde_json::json;

use super::synthetic::{SyntheticScene, SyntheticSceneQuery, camera_view};
use super::*;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        instance_name: "mower".to_owned(),
        model_image: ImageExtent::new(8, 8),
        ..PipelineConfig::default()
    }
}

fn manual_manager(
    config: PipelineConfig,
    extent: ImageExtent,
) -> (CaptureManager, ManualReadbackController, ChannelReceiver) {
    let (source, controller) = ManualReadbackSource::new(extent);
    let (transport, receiver) = channel_transport(8).expect("transport");
    let manager = CaptureManager::new(config, Some(Box::new(source)), Box::new(transport), None)
        .expect("capture manager");
    (manager, controller, receiver)
}

const SCENARIO_RAW: [Pixel; 4] = [
    Pixel::opaque(10, 20, 30),
    Pixel::opaque(40, 50, 60),
    Pixel::opaque(70, 80, 90),
    Pixel::opaque(100, 110, 120),
];

fn fill_scenario_frame(sink: &mut ReadbackSink) {
    let (raw, segmentation) = sink.buffers_mut();
    raw.pixels_mut().copy_from_slice(&SCENARIO_RAW);
    for (pixel, id) in segmentation.pixels_mut().iter_mut().zip([133, 250, 0, 133]) {
        *pixel = Pixel::stencil(id);
    }
}

fn decode_image(event: &OutboundEvent, field: &str) -> Vec<u8> {
    let encoded = event.payload[field].as_str().expect("image field is a string");
    let png = STANDARD.decode(encoded).expect("valid base64");
    image::load_from_memory_with_format(&png, image::ImageFormat::Png)
        .expect("valid png")
        .to_rgba8()
        .into_raw()
}

#[test]
fn issues_one_capture_per_cadence_window() {
    let (mut manager, controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    let mut issued_ticks = Vec::new();
    for _ in 0..10 {
        let report = manager.on_tick();
        if report.issued.is_some() {
            issued_ticks.push(report.tick);
            controller.complete_next(fill_scenario_frame);
        }
    }

    assert_eq!(issued_ticks, vec![0, 5]);
    assert_eq!(controller.submitted_count(), 2);
}

#[test]
fn completed_frame_is_classified_and_emitted() {
    let (mut manager, controller, receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    let first = manager.on_tick();
    assert!(first.issued.is_some());
    assert!(receiver.is_empty());
    assert!(controller.complete_next(fill_scenario_frame));

    let second = manager.on_tick();
    assert_eq!(second.drained, first.issued);
    assert!(second.emitted);

    let event = receiver.pop().expect("image event");
    assert_eq!(event.event_name, "imageJson");
    assert_eq!(event.payload["name1"], "mower_1");
    assert_eq!(event.payload["name2"], "mower_2");
    // Tree: one pixel (1,0); Wall: (0,0) and (3,0).
    assert_eq!(event.payload["arr2"], json!([2, 1, 0, 4, 0, 0, 3, 0]));

    let raw = decode_image(&event, "image1");
    assert_eq!(raw.as_slice(), rgba_bytes(&SCENARIO_RAW));
    let classified = decode_image(&event, "image2");
    let expected = [Pixel::RED, Pixel::BLUE, SCENARIO_RAW[2], Pixel::RED];
    assert_eq!(classified.as_slice(), rgba_bytes(&expected));
    assert!(receiver.is_empty());
}

fn rgba_bytes(pixels: &[Pixel]) -> Vec<u8> {
    pixels.iter().flat_map(|p| [p.r, p.g, p.b, p.a]).collect()
}

#[test]
fn pending_request_blocks_new_captures_and_is_never_drained() {
    let (mut manager, controller, receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    for _ in 0..=20 {
        let report = manager.on_tick();
        assert!(report.drained.is_none());
        assert!(controller.pending_count() <= 1);
    }

    assert_eq!(controller.submitted_count(), 1);
    assert!(manager.has_request_in_flight());
    assert_eq!(manager.scheduler_stats().skipped_in_flight, 4);
    assert!(receiver.is_empty());
    assert_eq!(manager.stats().frames_processed, 0);
}

#[test]
fn request_completing_on_cadence_tick_is_drained_then_reissued() {
    let (mut manager, controller, receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    let first = manager.on_tick();
    for _ in 1..5 {
        manager.on_tick();
    }
    controller.complete_next(fill_scenario_frame);

    let report = manager.on_tick();
    assert_eq!(report.tick, 5);
    assert_eq!(report.drained, first.issued);
    assert!(report.issued.is_some());
    assert_ne!(report.issued, first.issued);
    assert_eq!(receiver.len(), 1);
    assert_eq!(controller.pending_count(), 1);
}

#[test]
fn failed_readback_is_discarded_and_capturing_resumes() {
    let (mut manager, controller, receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    manager.on_tick();
    assert!(controller.fail_next());

    let report = manager.on_tick();
    assert!(report.drained.is_none());
    assert!(!manager.has_request_in_flight());
    assert_eq!(manager.pool_stats().failed, 1);

    for _ in 2..=5 {
        manager.on_tick();
    }
    assert_eq!(controller.submitted_count(), 2);
    assert!(receiver.is_empty());
}

#[test]
fn rejected_submit_is_counted_and_skipped() {
    let (mut manager, controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));
    controller.set_reject_submits(true);

    let report = manager.on_tick();
    assert!(report.issued.is_none());
    assert_eq!(manager.stats().issue_failures, 1);
    assert!(!manager.has_request_in_flight());

    controller.set_reject_submits(false);
    for _ in 1..=5 {
        manager.on_tick();
    }
    assert_eq!(manager.stats().captures_issued, 1);
}

#[test]
fn missing_capture_target_skips_without_stopping_ticks() {
    let (transport, receiver) = channel_transport(4).expect("transport");
    let mut manager =
        CaptureManager::new(test_config(), None, Box::new(transport), None).expect("manager");

    for _ in 0..=10 {
        let report = manager.on_tick();
        assert!(report.issued.is_none());
    }
    assert_eq!(manager.stats().missing_target, 3);
    assert!(receiver.is_empty());

    let (source, controller) = ManualReadbackSource::new(ImageExtent::new(4, 1));
    manager.set_capture_target(Some(Box::new(source)));
    let mut issued = None;
    for _ in 11..=15 {
        let report = manager.on_tick();
        if report.issued.is_some() {
            issued = Some(report.tick);
        }
    }
    assert_eq!(issued, Some(15));
    assert_eq!(controller.submitted_count(), 1);
}

#[test]
fn inference_runs_on_drained_frames() {
    let (mut manager, controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    manager.on_tick();
    controller.complete_next(fill_scenario_frame);
    let drained = manager.on_tick();
    assert!(drained.drained.is_some());
    assert!(drained.task_started.is_some());

    for _ in 0..5_000 {
        if manager.stats().inference_completed > 0 {
            break;
        }
        manager.on_tick();
        std::thread::sleep(Duration::from_millis(1));
    }

    let summary = manager.latest_inference().expect("inference summary");
    assert_eq!(summary.request_id, drained.drained.expect("drained id"));
    assert_eq!(summary.model_image, ImageExtent::new(8, 8));
    assert_eq!(manager.stats().inference_failed, 0);
}

#[test]
fn processed_image_response_updates_drive_command() {
    let (mut manager, _controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));

    let command = manager
        .handle_server_event(
            "processedImage",
            &json!({ "name": "mower_1", "leftThrottle": 0.5, "rightThrottle": -0.25 }),
        )
        .expect("drive command");
    assert_eq!(command.left_throttle, 0.5);
    assert_eq!(command.right_throttle, -0.25);
    assert_eq!(manager.latest_drive_command(), Some(command));

    assert!(
        manager
            .handle_server_event("telemetry", &json!({ "speed": 3 }))
            .is_none()
    );
    assert!(
        manager
            .handle_server_event("processedImage", &json!({ "name": "mower_1" }))
            .is_none()
    );
    assert!(
        manager
            .handle_server_event(
                "processedImage",
                &json!({ "name": "other_1", "leftThrottle": 1.0, "rightThrottle": 1.0 }),
            )
            .is_none()
    );
    assert_eq!(manager.latest_drive_command(), Some(command));
    assert_eq!(manager.stats().drive_commands, 1);
}

#[test]
fn overlay_without_scene_query_is_disabled() {
    let mut config = test_config();
    config.overlay.enabled = true;
    let (mut manager, controller, receiver) = manual_manager(config, ImageExtent::new(4, 1));

    manager.on_tick();
    controller.complete_next(fill_scenario_frame);
    manager.on_tick();

    let event = receiver.pop().expect("image event");
    let classified = decode_image(&event, "image2");
    let expected = [Pixel::RED, Pixel::BLUE, SCENARIO_RAW[2], Pixel::RED];
    assert_eq!(classified.as_slice(), rgba_bytes(&expected));
}

#[test]
fn overlay_tints_projected_actor_outlines() {
    let extent = ImageExtent::new(64, 36);
    let mut config = test_config();
    config.overlay.enabled = true;
    config.overlay.alpha = 1.0;
    let (source, controller) = ManualReadbackSource::new(extent);
    controller.set_view(camera_view(extent));
    let (transport, receiver) = channel_transport(4).expect("transport");
    let mut manager = CaptureManager::new(
        config,
        Some(Box::new(source)),
        Box::new(transport),
        Some(Arc::new(SyntheticSceneQuery::default())),
    )
    .expect("manager");

    manager.on_tick();
    controller.complete_next(|sink| sink.raw_mut().pixels_mut().fill(Pixel::BLACK));
    manager.on_tick();

    let event = receiver.pop().expect("image event");
    let classified = decode_image(&event, "image2");
    let red_pixels = classified
        .chunks_exact(4)
        .filter(|pixel| *pixel == [255, 0, 0, 255])
        .count();
    assert!(red_pixels > 0);
    // Stencil ids were all zero, so nothing is classified.
    assert_eq!(event.payload["arr2"], json!([]));
}

#[test]
fn shutdown_abandons_request_that_never_completes() {
    let (mut manager, _controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));
    let issued = manager.on_tick().issued.expect("issued");

    let outcome = manager.shutdown(Duration::from_millis(5));
    assert_eq!(outcome, ShutdownOutcome::Abandoned(issued));
}

#[test]
fn shutdown_releases_completed_request() {
    let (mut manager, controller, _receiver) = manual_manager(test_config(), ImageExtent::new(4, 1));
    let issued = manager.on_tick().issued.expect("issued");
    controller.complete_next(fill_scenario_frame);

    let outcome = manager.shutdown(Duration::from_millis(5));
    assert_eq!(outcome, ShutdownOutcome::Released(issued));
}

#[test]
fn render_thread_scene_streams_classified_frames() {
    let extent = ImageExtent::new(64, 36);
    let mut source = RenderThreadSource::start(
        RenderThreadConfig {
            extent,
            submit_queue_capacity: 1,
            readback_latency: Duration::ZERO,
        },
        SyntheticScene::new(),
    )
    .expect("render thread");
    source.set_view(camera_view(extent));
    let (transport, receiver) = channel_transport(4).expect("transport");
    let mut config = test_config();
    config.frame_mod = 2;
    let mut manager = CaptureManager::new(config, Some(Box::new(source)), Box::new(transport), None)
        .expect("manager");

    let mut event = None;
    for _ in 0..5_000 {
        manager.on_tick();
        if let Some(received) = receiver.pop() {
            event = Some(received);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    let event = event.expect("render thread produced a frame");

    let locations: Vec<u32> = serde_json::from_value(event.payload["arr2"].clone()).expect("arr2");
    assert!(!locations.is_empty());
    let tree_values = locations[0] as usize;
    assert_eq!(tree_values % 2, 0);
    let wall_values = locations[tree_values + 1] as usize;
    assert_eq!(locations.len(), tree_values + wall_values + 2);

    let classified = decode_image(&event, "image2");
    let blue = classified
        .chunks_exact(4)
        .filter(|pixel| *pixel == [0, 0, 255, 255])
        .count();
    assert_eq!(blue * 2, tree_values);
    let (tree_x, tree_y) = (locations[1], locations[2]);
    let index = (tree_y * extent.width + tree_x) as usize * 4;
    assert_eq!(&classified[index..index + 4], &[0, 0, 255, 255]);
}

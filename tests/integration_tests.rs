
use std::sync::Arc;
use std::time::Duration;

use test_helpers::*;
use tile_orchestrator::progress::run_reporter;
use tile_orchestrator::*;

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(20);

async fn run_pipeline(
    grid: Arc<FakeGrid>,
    job: Job,
    config: PipelineConfig,
    sink: RecordingSink,
) -> RunReport {
    let pipeline = RenderPipeline::builder(grid, job)
        .with_config(config)
        .with_sink(Box::new(sink))
        .build()
        .unwrap();
    tokio::time::timeout(SCENARIO_TIMEOUT, pipeline.run())
        .await
        .expect("pipeline did not finish")
        .unwrap()
}

fn tile(job: &Job, coord_x: u32, coord_y: u32) -> Tile {
    Tile {
        index: 0,
        coord_x,
        coord_y,
        width: job.tile_width,
        height: job.tile_height,
        samples: job.samples_per_pass,
    }
}

#[tokio::test]
async fn test_two_by_two_single_pass_composes_full_image() {
    let grid = Arc::new(FakeGrid::new());
    let job = Job::new(8, 8).with_tile_size(4, 4);
    let sink = RecordingSink::default();

    let report = run_pipeline(
        grid.clone(),
        job.clone(),
        fast_config().build().unwrap(),
        sink.clone(),
    )
    .await;

    assert_eq!(report.summary.outcome, RunOutcome::Completed);
    assert!(uuid::Uuid::parse_str(&report.summary.run_id).is_ok());
    assert_eq!(report.summary.progress.finalized_tiles, 4);
    assert_eq!(report.summary.progress.tile_count, 4);

    let frame = report.frame.expect("compositor returned no frame");
    assert_frame_composed(&frame, &job, 1, default_fill);
    assert_eq!(*sink.last.lock().unwrap(), frame.as_bytes());

    let stats = grid.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.tasks_submitted, 4);
    assert_eq!(stats.cancel_calls, 0);
}

fn stripes(tile: usize, pass: usize) -> u8 {
    (tile * 17 + pass * 5 + 3) as u8
}

#[tokio::test]
async fn test_polling_mode_composes_full_image() {
    let grid = Arc::new(FakeGrid::new().with_passes(2).with_fill(stripes));
    let job = Job::new(12, 8).with_tile_size(4, 4);
    let config = fast_config()
        .with_watch_mode(WatchMode::Polling)
        .with_tile_order(TileOrder::Shuffled)
        .build()
        .unwrap();

    let report = run_pipeline(grid.clone(), job.clone(), config, RecordingSink::default()).await;

    assert!(report.summary.is_success());
    assert_eq!(report.summary.progress.expected, 12);
    assert_eq!(report.summary.progress.retrieved, 12);
    assert_frame_composed(report.frame.as_ref().unwrap(), &job, 2, stripes);
}

#[tokio::test]
async fn test_overlay_blends_every_pass_gamma_correctly() {
    let passes = 3;
    let grid = Arc::new(FakeGrid::new().with_passes(passes).with_overlay(true));
    let job = Job::new(8, 4).with_tile_size(4, 4).with_overlay(true);

    let report = run_pipeline(
        grid,
        job.clone(),
        fast_config().build().unwrap(),
        RecordingSink::default(),
    )
    .await;

    assert!(report.summary.is_success());
    let frame = report.frame.unwrap();
    assert_frame_composed(&frame, &job, passes, default_fill);
    assert_eq!(frame.passes((0, 0)), passes as u32);

    // Running blend stays within rounding of the exact linear-light mean
    for t in 0..2 {
        let mean_lin: f64 = (0..passes)
            .map(|p| (default_fill(t, p) as f64 / 255.0).powf(2.2))
            .sum::<f64>()
            / passes as f64;
        let exact = mean_lin.powf(1.0 / 2.2) * 255.0;
        let got = expected_value(t, passes, true, default_fill) as f64;
        assert!((got - exact).abs() <= 1.5, "tile {}: {} vs {}", t, got, exact);
    }
}

#[tokio::test]
async fn test_aborted_result_cancels_session_once() {
    let grid = Arc::new(FakeGrid::new().with_aborted_tile(1));
    let job = Job::new(16, 16).with_tile_size(4, 4);
    let config = fast_config()
        .with_max_in_flight(2)
        .with_submit_batch_size(1)
        .with_tile_order(TileOrder::Raster)
        .build()
        .unwrap();

    let report = run_pipeline(grid.clone(), job, config, RecordingSink::default()).await;

    match &report.summary.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("aborted")),
        other => panic!("expected abort, got {:?}", other),
    }
    let stats = grid.stats();
    assert_eq!(stats.cancel_calls, 1);
    assert_eq!(stats.submits_after_cancel, 0);
    assert!(stats.tasks_submitted <= 16);
}

#[tokio::test]
async fn test_task_error_aborts_run() {
    let grid = Arc::new(FakeGrid::new().with_failed_task(0));
    let job = Job::new(8, 8).with_tile_size(4, 4);
    let config = fast_config()
        .with_max_in_flight(1)
        .with_tile_order(TileOrder::Raster)
        .build()
        .unwrap();

    let report = run_pipeline(grid.clone(), job, config, RecordingSink::default()).await;

    match &report.summary.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("t1")),
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(grid.stats().cancel_calls, 1);
}

#[tokio::test]
async fn test_corrupt_result_aborts_run() {
    let grid = Arc::new(FakeGrid::new().with_corrupt_tile(2));
    let job = Job::new(8, 8).with_tile_size(4, 4);

    let report = run_pipeline(
        grid.clone(),
        job,
        fast_config().build().unwrap(),
        RecordingSink::default(),
    )
    .await;

    match &report.summary.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("could not be decoded")),
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(grid.stats().cancel_calls, 1);
}

#[tokio::test]
async fn test_oversized_result_header_aborts_run() {
    let grid = Arc::new(FakeGrid::new().with_oversized_tile(0));
    let job = Job::new(8, 8).with_tile_size(4, 4);

    let report = run_pipeline(
        grid.clone(),
        job,
        fast_config().build().unwrap(),
        RecordingSink::default(),
    )
    .await;

    match &report.summary.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("could not be decoded")),
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(grid.stats().cancel_calls, 1);
}

#[tokio::test]
async fn test_event_stream_failures_resubscribe_and_complete() {
    let grid = Arc::new(FakeGrid::new().with_passes(2).with_unstable_events(1, 1));
    let job = Job::new(8, 8).with_tile_size(4, 4);
    let config = fast_config()
        .with_watch_mode(WatchMode::Events)
        .build()
        .unwrap();

    let report = run_pipeline(grid.clone(), job.clone(), config, RecordingSink::default()).await;

    assert!(report.summary.is_success());
    assert_frame_composed(report.frame.as_ref().unwrap(), &job, 2, default_fill);
    let stats = grid.stats();
    assert!(stats.subscriptions >= 2, "subscriptions: {}", stats.subscriptions);
    assert_eq!(stats.broken_streams, 1);
    assert_eq!(stats.cancel_calls, 0);
}

#[tokio::test]
async fn test_user_cancellation_cancels_session_once() {
    // Downloads never succeed, so only cancellation ends the run
    let grid = Arc::new(FakeGrid::new().with_flaky_downloads(usize::MAX));
    let job = Job::new(8, 8).with_tile_size(4, 4);
    let pipeline = RenderPipeline::builder(grid.clone(), job)
        .with_config(fast_config().build().unwrap())
        .build()
        .unwrap();

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(SCENARIO_TIMEOUT, pipeline.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.summary.outcome, RunOutcome::Cancelled);
    assert_eq!(grid.stats().cancel_calls, 1);
}

#[tokio::test]
async fn test_transient_download_failures_are_retried() {
    let grid = Arc::new(FakeGrid::new().with_flaky_downloads(5));
    let job = Job::new(8, 8).with_tile_size(4, 4);

    let report = run_pipeline(
        grid.clone(),
        job.clone(),
        fast_config().with_retrieve_workers(2).build().unwrap(),
        RecordingSink::default(),
    )
    .await;

    assert!(report.summary.is_success());
    assert_frame_composed(report.frame.as_ref().unwrap(), &job, 1, default_fill);
    let stats = grid.stats();
    assert_eq!(stats.failed_downloads, 5);
    assert_eq!(stats.downloads, 4 + 5);
}

#[tokio::test]
async fn test_rejected_tile_is_recorded_and_rest_completes() {
    let grid = Arc::new(FakeGrid::new().with_rejected_tile(3));
    let job = Job::new(8, 8).with_tile_size(4, 4);

    let report = run_pipeline(
        grid,
        job,
        fast_config().build().unwrap(),
        RecordingSink::default(),
    )
    .await;

    assert!(report.summary.is_success());
    assert_eq!(report.summary.submission_failures.len(), 1);
    assert_eq!(report.summary.submission_failures[0].tile_index, 3);
    assert_eq!(report.summary.progress.finalized_tiles, 3);
    assert_eq!(report.summary.progress.failed_submissions, 1);
}

#[tokio::test]
async fn test_backpressure_never_exceeds_cap() {
    let grid = Arc::new(FakeGrid::new());
    let job = Job::new(24, 24).with_tile_size(4, 4);
    let config = fast_config()
        .with_max_in_flight(5)
        .with_submit_batch_size(3)
        .build()
        .unwrap();

    let report = run_pipeline(grid.clone(), job, config, RecordingSink::default()).await;

    assert!(report.summary.is_success());
    assert_eq!(grid.stats().tasks_submitted, 36);
    assert!(grid.stats().peak_non_terminal <= 5);
    assert!(report.summary.peak_in_flight <= 5);
}

#[tokio::test]
async fn test_auto_rerun_resets_display_between_passes() {
    let grid = Arc::new(FakeGrid::new());
    let job = Job::new(8, 8).with_tile_size(4, 4);
    let pipeline = RenderPipeline::builder(grid.clone(), job.clone())
        .with_config(fast_config().build().unwrap())
        .with_auto_rerun(true)
        .with_max_runs(2)
        .build()
        .unwrap();

    let report = tokio::time::timeout(SCENARIO_TIMEOUT, pipeline.run())
        .await
        .unwrap()
        .unwrap();

    assert!(report.summary.is_success());
    assert_eq!(report.summary.runs, 2);
    assert_eq!(grid.stats().tasks_submitted, 8);
    assert_eq!(grid.stats().sessions_created, 1);

    let frame = report.frame.unwrap();
    assert_frame_composed(&frame, &job, 1, default_fill);
    assert_eq!(frame.passes((0, 0)), 1);
}

#[tokio::test]
async fn test_final_frame_written_to_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("final.png");
    let grid = Arc::new(FakeGrid::new());
    let job = Job::new(8, 4).with_tile_size(4, 4);

    let pipeline = RenderPipeline::builder(grid, job)
        .with_config(fast_config().build().unwrap())
        .with_output(&output)
        .build()
        .unwrap();
    let report = tokio::time::timeout(SCENARIO_TIMEOUT, pipeline.run())
        .await
        .unwrap()
        .unwrap();

    assert!(report.summary.is_success());
    let img = image::open(&output).unwrap().to_rgb8();
    assert_eq!(img.dimensions(), (8, 4));
    assert_eq!(img.get_pixel(5, 0).0, [default_fill(1, 0); 3]);
}

#[tokio::test]
async fn test_unwritable_output_is_returned_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("missing").join("final.png");
    let grid = Arc::new(FakeGrid::new());
    let job = Job::new(8, 4).with_tile_size(4, 4);

    let pipeline = RenderPipeline::builder(grid.clone(), job)
        .with_config(fast_config().build().unwrap())
        .with_output(&output)
        .build()
        .unwrap();
    let result = tokio::time::timeout(SCENARIO_TIMEOUT, pipeline.run())
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(PipelineError::Image(_)) | Err(PipelineError::Io(_))
    ));
    assert!(!output.exists());
    assert_eq!(grid.stats().cancel_calls, 0);
}

#[tokio::test]
async fn test_chain_of_k_requests_k_minus_one_watches() {
    let k = 4;
    let grid = Arc::new(FakeGrid::new().with_passes(k));
    let ctx = Arc::new(SharedContext::new("session-1"));
    let tracker = Arc::new(ProgressTracker::new());
    let job = Job::new(4, 4).with_tile_size(4, 4);

    let outcome = grid
        .submit(
            "session-1",
            vec![TaskRequest {
                tile_index: 0,
                payload: TracerPayload::for_tile(&job, &tile(&job, 0, 0)).encode(),
            }],
            &TaskOptions::default(),
        )
        .await
        .unwrap();

    let retriever = Retriever::new(
        grid.clone(),
        ctx.clone(),
        tracker.clone(),
        false,
        Duration::from_millis(10),
    );

    let mut next = Some(outcome.accepted[0].result_id.clone());
    let mut watch_requests = 0;
    while let Some(id) = next.take() {
        let result = retriever.retrieve(&id).await.unwrap();
        if !result.is_final {
            next = ctx.to_watch.try_get();
            assert_eq!(next.as_deref(), Some(result.next_result_id.as_str()));
            watch_requests += 1;
        }
    }

    let mut markers = Vec::new();
    while let Some(marker) = ctx.finalized.try_get() {
        markers.push(marker);
    }
    assert_eq!(watch_requests, k - 1);
    assert_eq!(markers.len(), k);
    assert_eq!(markers.iter().filter(|m| m.is_final).count(), 1);
    assert!(markers.last().unwrap().is_final);
    assert_eq!(ctx.to_display.len(), k);
    assert_eq!(tracker.snapshot().expected, k - 1);
}

#[tokio::test]
async fn test_duplicate_completed_events_forward_once() {
    let grid = Arc::new(FakeGrid::new());
    let ctx = Arc::new(SharedContext::new("session-1"));
    let tracker = Arc::new(ProgressTracker::new());
    let job = Job::new(4, 4).with_tile_size(4, 4);

    let outcome = grid
        .submit(
            "session-1",
            vec![TaskRequest {
                tile_index: 0,
                payload: TracerPayload::for_tile(&job, &tile(&job, 0, 0)).encode(),
            }],
            &TaskOptions::default(),
        )
        .await
        .unwrap();
    let result_id = outcome.accepted[0].result_id.clone();

    let watcher = tokio::spawn(
        StatusWatcher::new(
            grid.clone(),
            ctx.clone(),
            tracker.clone(),
            fast_config().build().unwrap(),
        )
        .run(),
    );
    ctx.to_watch.put(result_id.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.to_retrieve.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    for _ in 0..3 {
        grid.emit(ResultEvent::new(result_id.clone(), ResultStatus::Completed));
    }
    ctx.to_watch.put(result_id.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    ctx.stop_watching.set();
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ctx.to_retrieve.len(), 1);
    assert_eq!(ctx.to_retrieve.try_get(), Some(result_id));
    assert_eq!(tracker.snapshot().available, 1);
    assert!(!ctx.is_aborted());
}

#[tokio::test]
async fn test_progress_is_monotonic_under_chain_extension() {
    let grid = Arc::new(FakeGrid::new().with_passes(3));
    let ctx = Arc::new(SharedContext::new("session-1"));
    let tracker = Arc::new(ProgressTracker::new());
    let config = fast_config().build().unwrap();
    let job = Job::new(8, 8).with_tile_size(4, 4);

    let watcher = tokio::spawn(
        StatusWatcher::new(grid.clone(), ctx.clone(), tracker.clone(), config.clone()).run(),
    );
    let retriever = tokio::spawn(
        Retriever::new(
            grid.clone(),
            ctx.clone(),
            tracker.clone(),
            false,
            config.queue_timeout,
        )
        .run(2),
    );
    let reporter = tokio::spawn(run_reporter(
        ctx.clone(),
        tracker.clone(),
        config.progress_interval,
        config.queue_timeout,
    ));

    let sampler = {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let mut last_retrieved = 0;
            let mut samples = 0;
            while !tracker.is_done() {
                let s = tracker.snapshot();
                assert!(s.retrieved >= last_retrieved);
                assert!(s.retrieved <= s.expected);
                assert!(s.finalized_tiles <= s.tile_count);
                last_retrieved = s.retrieved;
                samples += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            samples
        })
    };

    let mut submitter = TaskSubmitter::new(grid.clone(), ctx.clone(), tracker.clone(), config);
    let tiles = generate_tiles(&job, TileOrder::CenterOut);
    let report = submitter.submit_batch(&job, &tiles).await.unwrap();
    assert_eq!(report.submitted.len(), 4);

    tokio::time::timeout(SCENARIO_TIMEOUT, reporter)
        .await
        .unwrap()
        .unwrap();
    let samples = sampler.await.unwrap();
    assert!(samples > 0);

    let s = tracker.snapshot();
    assert_eq!(s.expected, 12);
    assert_eq!(s.retrieved, 12);
    assert_eq!(s.finalized_tiles, 4);

    ctx.stop_all();
    watcher.await.unwrap();
    retriever.await.unwrap();
}

#[tokio::test]
async fn test_reset_mid_job_leaves_no_residue() {
    let ctx = Arc::new(SharedContext::new("session-1"));
    let tracker = Arc::new(ProgressTracker::new());
    let sink = RecordingSink::default();
    let compositor = tokio::spawn(
        Compositor::new(ctx.clone(), tracker.clone(), 8, 4, Box::new(sink.clone()))
            .with_overlay(true)
            .with_queue_timeout(Duration::from_millis(10))
            .with_frame_interval(Duration::from_millis(5))
            .run(),
    );

    let pass = |coord_y: u32, fill: u8| TracerResult {
        coord_x: 0,
        coord_y,
        tile_width: 4,
        tile_height: 4,
        samples: 100,
        is_final: false,
        pixels: vec![fill; 48],
        weights: Vec::new(),
        next_result_id: "next".into(),
    };

    ctx.to_display.put(pass(0, 200));
    ctx.to_display.put(pass(0, 100));
    ctx.to_display.put(pass(4, 50));
    tokio::time::timeout(Duration::from_secs(5), ctx.to_display.join())
        .await
        .unwrap();

    ctx.reset_display.set();
    ctx.to_display.put(pass(0, 30));
    tokio::time::timeout(Duration::from_secs(5), ctx.to_display.join())
        .await
        .unwrap();

    ctx.stop_display.set();
    let frame = tokio::time::timeout(Duration::from_secs(5), compositor)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(frame.pixel(0, 0), [30, 30, 30]);
    assert_eq!(frame.passes((0, 0)), 1);
    assert_eq!(frame.pixel(4, 0), [0, 0, 0]);
    assert_eq!(frame.passes((0, 4)), 0);
    assert_eq!(*sink.last.lock().unwrap(), frame.as_bytes());
}

#[tokio::test]
async fn test_display_batches_tiles_per_frame() {
    let ctx = Arc::new(SharedContext::new("session-1"));
    let tracker = Arc::new(ProgressTracker::new());
    let sink = RecordingSink::default();

    for i in 0..50u32 {
        ctx.to_display.put(TracerResult {
            coord_x: 0,
            coord_y: i % 8,
            tile_width: 1,
            tile_height: 1,
            samples: 1,
            is_final: true,
            pixels: vec![i as u8; 3],
            weights: Vec::new(),
            next_result_id: String::new(),
        });
    }

    let compositor = tokio::spawn(
        Compositor::new(ctx.clone(), tracker.clone(), 8, 1, Box::new(sink.clone()))
            .with_queue_timeout(Duration::from_millis(10))
            .with_frame_interval(Duration::from_secs(10))
            .run(),
    );
    tokio::time::timeout(Duration::from_secs(5), ctx.to_display.join())
        .await
        .unwrap();
    ctx.stop_display.set();
    compositor.await.unwrap();

    assert_eq!(tracker.snapshot().displayed, 50);
    assert!(sink.present_count() <= 2, "presented {} frames", sink.present_count());
}

#[test]
fn test_pipeline_builder_rejects_empty_job() {
    let grid = Arc::new(FakeGrid::new());
    let err = RenderPipeline::builder(grid, Job::new(0, 10))
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
}

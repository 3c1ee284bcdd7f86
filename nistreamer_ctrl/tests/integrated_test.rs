use std::sync::Arc;

use nistreamer_compiler::*;
use nistreamer_ctrl::*;

fn two_card_streamer() -> (Streamer, Arc<RecordingBackend>) {
    let backend = Arc::new(RecordingBackend::new());
    let mut streamer = Streamer::new(backend.clone());
    streamer.add_ao_card("PXI1Slot3", 1e6).unwrap();
    streamer.add_ao_card("PXI1Slot4", 1e6).unwrap();
    let ao3 = streamer.add_ao_chan("PXI1Slot3", 0, 0.).unwrap();
    let ao4 = streamer.add_ao_chan("PXI1Slot4", 0, 0.).unwrap();
    streamer.constant(&ao3, 0., 1., 5., false).unwrap();
    streamer.sine(&ao4, 0., 1., SineArgs { amp: 1., freq: 7., ..Default::default() }, false)
        .unwrap();
    streamer.compile(None).unwrap();
    (streamer, backend)
}

fn start(card: &str) -> BackendCall {
    BackendCall::Start(card.to_string())
}

fn close_run(card: &str) -> BackendCall {
    BackendCall::CloseRun(card.to_string())
}

fn export_ref_clk(streamer: &mut Streamer) {
    streamer
        .set_ref_clk_provider(Some(("PXI1Slot3", "PXI_Trig7")))
        .unwrap();
}

fn ref_clk_disconnected(backend: &RecordingBackend) -> bool {
    let disconnect = BackendCall::DisconnectTerms {
        src: "/PXI1Slot3/10MHzRefClock".to_string(),
        dest: "/PXI1Slot3/PXI_Trig7".to_string(),
    };
    backend.position(&disconnect).is_some() && backend.connections().is_empty()
}

#[test]
fn starts_last_card_starts_after_others() {
    let (mut streamer, backend) = two_card_streamer();
    streamer.set_starts_last(Some("PXI1Slot4")).unwrap();

    for _ in 0..50 {
        backend.clear_calls();
        let summary = streamer.run(1, 50.).unwrap();
        assert_eq!(summary.reps_done, 1);
        let a = backend.position(&start("PXI1Slot3")).unwrap();
        let b = backend.position(&start("PXI1Slot4")).unwrap();
        assert!(a < b);
    }
}

#[test]
fn ref_clk_export_is_reverted_after_close() {
    let (mut streamer, backend) = two_card_streamer();
    streamer
        .set_ref_clk_provider(Some(("PXI1Slot3", "PXI_Clk10")))
        .unwrap();

    let guard = streamer.cfg_run(50.).unwrap();
    assert_eq!(guard.state(), RunState::Configured);
    assert!(backend.is_connected("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Clk10"));
    guard.close().unwrap();

    assert!(!backend.is_connected("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Clk10"));
    assert!(backend.connections().is_empty());
    let connect = backend
        .position(&BackendCall::ConnectTerms {
            src: "/PXI1Slot3/10MHzRefClock".to_string(),
            dest: "/PXI1Slot3/PXI_Clk10".to_string(),
        })
        .unwrap();
    let cfg = backend
        .position(&BackendCall::CfgRun { device: "PXI1Slot3".to_string(), bufsize_ms: 50. })
        .unwrap();
    assert!(connect < cfg);
}

#[test]
fn run_requires_fresh_compile() {
    let (mut streamer, backend) = two_card_streamer();
    let ao3 = ChanHandle::new("PXI1Slot3", "ao0");
    streamer.constant(&ao3, 2., 1., 1., false).unwrap();

    assert!(matches!(streamer.run(1, 50.), Err(StreamerError::NotCompiled(_))));
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CfgRun { .. })), 0);
}

#[test]
fn repetitions_calc_next() {
    let (mut streamer, backend) = two_card_streamer();
    let summary = streamer.run(3, 50.).unwrap();
    assert_eq!(summary, RunSummary { reps_done: 3, cancelled: false });

    let calc_next: Vec<bool> = backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            BackendCall::StreamRun { device, calc_next } if device == "PXI1Slot3" => Some(calc_next),
            _ => None,
        })
        .collect();
    assert_eq!(calc_next, vec![true, true, false]);
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CfgRun { .. })), 2);
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CloseRun(_))), 2);
}

#[test]
fn cancel_between_repetitions() {
    let (mut streamer, backend) = two_card_streamer();
    export_ref_clk(&mut streamer);
    let runner = StreamRunner::new(StreamCfg { nreps: 5, ..Default::default() });
    let token = runner.cancel_token();
    backend.set_stream_hook(move |_, _| token.cancel());

    let summary = runner.run(&mut streamer).unwrap();
    assert_eq!(summary, RunSummary { reps_done: 1, cancelled: true });
    assert_eq!(backend.count(|c| matches!(c, BackendCall::StreamRun { .. })), 2);
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CloseRun(_))), 2);
    assert!(ref_clk_disconnected(&backend));
}

#[test]
fn cancel_before_first_repetition() {
    let (mut streamer, backend) = two_card_streamer();
    export_ref_clk(&mut streamer);
    let token = CancelToken::new();
    let runner = StreamRunner::with_cancel(StreamCfg::default(), token.clone());
    token.cancel();

    let summary = runner.run(&mut streamer).unwrap();
    assert_eq!(summary, RunSummary { reps_done: 0, cancelled: true });
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CfgRun { .. })), 2);
    assert_eq!(backend.count(|c| matches!(c, BackendCall::StreamRun { .. })), 0);
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CloseRun(_))), 2);
    assert!(ref_clk_disconnected(&backend));
}

#[test]
fn close_failure_still_releases_other_card_and_ref_clk() {
    let (mut streamer, backend) = two_card_streamer();
    export_ref_clk(&mut streamer);
    backend.fail_on(close_run("PXI1Slot4"));

    assert!(matches!(streamer.run(1, 50.), Err(StreamerError::Backend(_))));
    assert!(backend.position(&close_run("PXI1Slot3")).is_some());
    assert!(ref_clk_disconnected(&backend));
}

#[test]
fn cfg_failure_still_closes_other_cards() {
    let (mut streamer, backend) = two_card_streamer();
    streamer
        .set_ref_clk_provider(Some(("PXI1Slot3", "PXI_Trig7")))
        .unwrap();
    backend.fail_on(BackendCall::CfgRun { device: "PXI1Slot4".to_string(), bufsize_ms: 50. });

    assert!(matches!(streamer.run(1, 50.), Err(StreamerError::Backend(_))));
    assert!(backend.position(&close_run("PXI1Slot3")).is_some());
    assert_eq!(backend.count(|c| matches!(c, BackendCall::StreamRun { .. })), 0);
    assert!(backend.connections().is_empty());
}

#[test]
fn stream_failure_still_closes_all_cards() {
    let (mut streamer, backend) = two_card_streamer();
    streamer
        .set_ref_clk_provider(Some(("PXI1Slot3", "PXI_Trig7")))
        .unwrap();
    backend.fail_on(BackendCall::StreamRun { device: "PXI1Slot4".to_string(), calc_next: true });

    assert!(matches!(streamer.run(2, 50.), Err(StreamerError::Backend(_))));
    // The loop stops after the failing repetition
    assert_eq!(backend.count(|c| matches!(c, BackendCall::StreamRun { .. })), 2);
    assert!(backend.position(&close_run("PXI1Slot3")).is_some());
    assert!(backend.position(&close_run("PXI1Slot4")).is_some());
    assert!(!backend.is_connected("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Trig7"));
}

#[test]
fn held_back_card_does_not_start_after_failure() {
    let (mut streamer, backend) = two_card_streamer();
    streamer.set_starts_last(Some("PXI1Slot4")).unwrap();
    backend.fail_on(start("PXI1Slot3"));

    assert!(streamer.run(1, 50.).is_err());
    assert!(backend.position(&start("PXI1Slot4")).is_none());
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CloseRun(_))), 2);
}

#[test]
fn dropped_guard_closes_run() {
    let (mut streamer, backend) = two_card_streamer();
    {
        let mut guard = streamer.cfg_run(20.).unwrap();
        assert_eq!(guard.cards(), vec!["PXI1Slot3", "PXI1Slot4"]);
        guard.stream_run(false).unwrap();
    }
    assert_eq!(backend.count(|c| matches!(c, BackendCall::CloseRun(_))), 2);
    // The registry is usable again once the guard is gone
    streamer.reset_card("PXI1Slot4").unwrap();
}

#[test]
fn inactive_cards_are_not_streamed() {
    let (mut streamer, backend) = two_card_streamer();
    streamer.add_do_card("PXI1Slot6", 1e7).unwrap();
    streamer.add_do_chan("PXI1Slot6", 0, 0, false, false).unwrap();
    streamer.compile(None).unwrap();

    streamer.run(1, 50.).unwrap();
    assert!(backend.position(&start("PXI1Slot6")).is_none());
    assert_eq!(backend.count(|c| matches!(c, BackendCall::Start(_))), 2);
}

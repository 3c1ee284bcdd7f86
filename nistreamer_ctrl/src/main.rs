use std::sync::Arc;

use nistreamer_compiler::*;
use nistreamer_ctrl::*;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let backend = Arc::new(RecordingBackend::new());
    let mut streamer = Streamer::new(backend.clone());

    streamer.add_ao_card("PXI1Slot3", 1e6)?;
    streamer.add_ao_card("PXI1Slot4", 1e6)?;
    streamer.add_do_card("PXI1Slot6", 1e7)?;
    streamer.reset_all()?;

    // PXI1Slot3 exports the start trigger and the 10 MHz reference clock,
    // the other cards import them and the DO card is clocked from the backplane
    streamer.cfg_start_trig("PXI1Slot3", "PXI_Trig0", true)?;
    streamer.cfg_ref_clk("PXI1Slot3", "PXI_Trig7", 1e7, true)?;
    streamer.cfg_start_trig("PXI1Slot4", "PXI_Trig0", false)?;
    streamer.cfg_ref_clk("PXI1Slot4", "PXI_Trig7", 1e7, false)?;
    streamer.cfg_start_trig("PXI1Slot6", "PXI_Trig0", false)?;
    streamer.cfg_samp_clk_src("PXI1Slot6", Some("PXI_Trig7"))?;
    streamer.set_starts_last(Some("PXI1Slot3"))?;

    let ao3 = streamer.add_ao_chan("PXI1Slot3", 0, 0.0)?;
    let ao4 = streamer.add_ao_chan("PXI1Slot4", 0, 0.0)?;
    let line0 = streamer.add_do_chan("PXI1Slot6", 0, 0, false, false)?;
    let line1 = streamer.add_do_chan("PXI1Slot6", 0, 1, false, false)?;

    let sine = SineArgs {
        amp: 2.0,
        freq: 5.0,
        ..Default::default()
    };
    for ao in [&ao3, &ao4] {
        streamer.sine(ao, 0.0, 1.0, sine, true)?;
        streamer.constant(ao, 10.0, 1.0 - 1e-6, 5.0, false)?;
    }
    for line in [&line0, &line1] {
        streamer.high(line, 0.0, 1.0)?;
        streamer.high(line, 10.0, 1.0 - 2e-6)?;
    }

    let stop_time = streamer.compile(Some(11.0))?;
    info!("compiled, stop time {stop_time} s, run time {} s", streamer.total_run_time()?);
    info!("{}", streamer.card("PXI1Slot3")?);

    let summary = streamer.run(2, 50.0)?;
    info!(
        "streamed {} repetitions, {} backend calls recorded",
        summary.reps_done,
        backend.calls().len()
    );
    Ok(())
}

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};

/// What should we do when the agent is asked to stop?
///
/// Nothing is drained: buffered lines that have not been delivered yet
/// are lost, and the next start reconciles from the runtime.
pub fn handle_shutdown() -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            log::info!("Received signal {signal}, exiting");
            std::process::exit(0);
        }
    });
    Ok(())
}

pub fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        log::debug!("Unable to notify service manager: {err}");
    }
}

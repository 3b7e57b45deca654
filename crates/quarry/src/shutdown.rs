use tokio_util::sync::CancellationToken;

/// First ^C cancels the session gracefully (in-flight runs finish, nothing
/// new is dispatched); a second ^C exits immediately.
pub fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut hits = 0u8;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            hits += 1;
            if hits == 1 {
                eprintln!(
                    "Stop requested — finishing in-flight runs (press CTRL+C again to exit immediately)."
                );
                cancel.cancel();
            } else {
                eprintln!("Stop requested again — exiting immediately.");
                std::process::exit(130);
            }
        }
    });
}

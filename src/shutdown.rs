use tokio::sync::watch;

/// Resolves once `true` has been published on the shutdown channel, or its
/// sender has gone away.
pub async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

//! Route panics through the log rather than letting them print straight to
//! stderr, so a panic in a spawned connection task shows up alongside the
//! rest of the structured log output.

use log::error;

pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("panic: {info}");
        default_hook(info);
    }));
}

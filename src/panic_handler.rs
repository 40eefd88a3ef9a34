use log::error;
use std::panic;

/// Install `better_panic` output plus a hook that records the panic in the
/// log file before the default report runs.
pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        error!("Thread '{name}' panicked: {panic_info}");
        log::logger().flush();

        default_hook(panic_info);
    }));
}

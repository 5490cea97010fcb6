use log::error;
use std::panic;

/// Install pretty backtraces and make sure a panic in any thread also ends up
/// in the log file, not only on stderr.
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

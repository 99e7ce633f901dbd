// Prevents additional console window on Windows in release builds
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

/// Entry point of the labdesk shell; everything lives in the library crate.
fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    labdesk_lib::run();
}

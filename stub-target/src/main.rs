//! Idle injection target for the end-to-end tests.
//!
//! Prints its pid and sleeps until killed, giving the tests a stable,
//! window-less process to launch suspended and inject into.

use std::time::Duration;

fn main() {
    println!("stub-target pid {}", std::process::id());
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

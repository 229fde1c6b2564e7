use backtrace::Backtrace;
use std::sync::Once;
use std::{panic, thread};

static INSTALL: Once = Once::new();

/// Routes panic reports through `log::error!`, keeping the payload intact
/// so unwinding still reaches whoever joins the panicking thread.
pub fn log_panics() {
    INSTALL.call_once(|| {
        panic::set_hook(Box::new(|info| {
            let backtrace = Backtrace::new();

            let thread = thread::current();
            let thread = thread.name().unwrap_or("unnamed");

            let msg = match info.payload().downcast_ref::<&'static str>() {
                Some(s) => *s,
                None => match info.payload().downcast_ref::<String>() {
                    Some(s) => s.as_str(),
                    None => "Box<Any>",
                },
            };

            match info.location() {
                Some(location) => log::error!(
                    target: "panic",
                    "thread '{}' panicked at '{}': {}:{}\n{:?}",
                    thread,
                    msg,
                    location.file(),
                    location.line(),
                    backtrace,
                ),
                None => log::error!(
                    target: "panic",
                    "thread '{}' panicked at '{}'\n{:?}",
                    thread,
                    msg,
                    backtrace,
                ),
            }
        }));
    });
}

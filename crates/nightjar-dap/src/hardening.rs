use std::{panic::PanicHookInfo, sync::Once};

use nightjar_config::{init_tracing, NightjarConfig};

static PANIC_HOOK: Once = Once::new();

/// Initialize structured logging and install a global panic hook for the
/// adapter process.
///
/// The hook records the panic through `tracing` and then defers to whatever
/// hook was installed before it. Calling this more than once is harmless.
pub fn init(config: &NightjarConfig) {
    init_tracing(&config.logging);
    install_panic_hook();
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info);
            let location = info
                .location()
                .map(|loc| loc.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            tracing::error!(
                target: "nightjar.dap",
                { panic.message = %message, panic.location = %location },
                "panic captured"
            );
            previous(info);
        }));
    });
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

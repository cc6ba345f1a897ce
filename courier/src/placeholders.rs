//! Lexical placeholder resolution for queue-group names.
//!
//! Supported placeholders, case-sensitive:
//! `{POD_NAME}`, `{HOSTNAME}`, `{MACHINE_NAME}`, `{ENV:NAME}`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{ENV:([^}]+)\}").expect("env placeholder regex"));

/// Expands placeholders in a queue-group name. Resolution is purely lexical;
/// unset `{ENV:NAME}` expands to the empty string.
pub fn resolve(input: &str) -> String {
    let machine = machine_name();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| machine.clone());
    let pod = std::env::var("POD_NAME").unwrap_or_else(|_| host.clone());

    let resolved = input
        .replace("{POD_NAME}", &pod)
        .replace("{HOSTNAME}", &host)
        .replace("{MACHINE_NAME}", &machine);

    ENV_PLACEHOLDER
        .replace_all(&resolved, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// The host's dns name.
fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Probe for the target_os.
    let target_os = TargetOs::new();

    // If we're forced to use the polling fallback, use that and return.
    if has_cfg("sockpoll_test_poll_backend") {
        autocfg::emit("sockpoll_poll");
        return;
    }

    // epoll is supported on Linux and Android
    if target_os.is("linux") || target_os.is("android") {
        autocfg::emit("sockpoll_epoll");
    }
    // Every other Unix falls back to poll().
    else if has_cfg("unix") {
        autocfg::emit("sockpoll_poll");
    }
}

/// Tell whether the `cfg` directive is set.
fn has_cfg(name: &str) -> bool {
    let env_check = format!("CARGO_CFG_{}", cfg_name(name));
    env::var_os(env_check).is_some()
}

struct TargetOs(String);

impl TargetOs {
    fn new() -> Self {
        let target_os = env::var_os("CARGO_CFG_TARGET_OS")
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self(target_os)
    }

    fn is(&self, os: &str) -> bool {
        self.0.split(',').any(|s| s == os)
    }
}

fn cfg_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_").replace('"', "")
}

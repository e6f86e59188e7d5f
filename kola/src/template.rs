//! Per-machine config templating.

/// Token replaced by the cluster's discovery URL.
pub const DISCOVERY_TOKEN: &str = "$discovery";

/// Token replaced by the machine's name, `instance<N>`.
pub const NAME_TOKEN: &str = "$name";

/// Produce `count` configs from `template`.
///
/// Every `$discovery` becomes `url`; every `$name` in config `i` becomes
/// `instance{i}`.
pub fn make_configs(url: &str, template: &str, count: usize) -> Vec<String> {
    let template = template.replace(DISCOVERY_TOKEN, url);
    (0..count)
        .map(|i| template.replace(NAME_TOKEN, &format!("instance{}", i)))
        .collect()
}

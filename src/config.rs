//! Lifetime bridge configuration.

use crate::resource::ResourceKind;

/// Environment variable overriding [`LifetimeConfig::strict_invariants`].
pub const STRICT_ENV: &str = "WEBCL_STRICT_LIFETIME";

/// Environment variable overriding [`LifetimeConfig::inline_host_completions`].
pub const INLINE_COMPLETIONS_ENV: &str = "WEBCL_INLINE_COMPLETIONS";

/// Default shutdown order: dependents before the resources they depend on.
pub const DEFAULT_DRAIN_ORDER: [ResourceKind; ResourceKind::COUNT] = [
    ResourceKind::Event,
    ResourceKind::Kernel,
    ResourceKind::MemoryObject,
    ResourceKind::Sampler,
    ResourceKind::CommandQueue,
    ResourceKind::Program,
    ResourceKind::Context,
    ResourceKind::Device,
    ResourceKind::Platform,
    ResourceKind::Exception,
];

/// Configuration for a [`ResourceContext`](crate::ResourceContext).
#[derive(Clone, Debug)]
pub struct LifetimeConfig {
    /// Treat use-after-destroy as fatal (panic) instead of logging it.
    ///
    /// Defaults to on in debug builds.
    pub strict_invariants: bool,
    /// Run completion callbacks inline when the resolving thread is already
    /// inside the owning host scope.
    pub inline_host_completions: bool,
    /// Kind order used by shutdown drain. Kinds missing from the list are
    /// drained last, in declaration order.
    pub drain_order: Vec<ResourceKind>,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            strict_invariants: cfg!(debug_assertions),
            inline_host_completions: true,
            drain_order: DEFAULT_DRAIN_ORDER.to_vec(),
        }
    }
}

impl LifetimeConfig {
    /// Configuration with use-after-destroy treated as fatal.
    pub fn strict() -> Self {
        Self {
            strict_invariants: true,
            ..Self::default()
        }
    }

    /// Configuration with use-after-destroy logged and ignored.
    pub fn permissive() -> Self {
        Self {
            strict_invariants: false,
            ..Self::default()
        }
    }

    /// Defaults overridden by `WEBCL_STRICT_LIFETIME` and `WEBCL_INLINE_COMPLETIONS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    ///
    /// Flags accept `1`/`true`/`yes`/`on` and `0`/`false`/`no`/`off`;
    /// anything else keeps the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(strict) = lookup(STRICT_ENV).as_deref().and_then(parse_flag) {
            config.strict_invariants = strict;
        }

        if let Some(inline) = lookup(INLINE_COMPLETIONS_ENV)
            .as_deref()
            .and_then(parse_flag)
        {
            config.inline_host_completions = inline;
        }

        config
    }

    /// The drain order, completed with any kinds it omits and deduplicated.
    pub fn effective_drain_order(&self) -> Vec<ResourceKind> {
        let mut order = Vec::with_capacity(ResourceKind::COUNT);

        for kind in self.drain_order.iter().chain(ResourceKind::ALL.iter()) {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }

        order
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!("Ignoring unrecognized flag value {:?}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup_overrides() {
        let config = LifetimeConfig::from_lookup(|key| match key {
            STRICT_ENV => Some("off".to_string()),
            INLINE_COMPLETIONS_ENV => Some("0".to_string()),
            _ => None,
        });

        assert!(!config.strict_invariants);
        assert!(!config.inline_host_completions);
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = LifetimeConfig::from_lookup(|_| Some("maybe".to_string()));
        let default = LifetimeConfig::default();

        assert_eq!(config.strict_invariants, default.strict_invariants);
        assert!(config.inline_host_completions);
    }

    #[test]
    fn test_effective_drain_order_completes_partial_list() {
        let config = LifetimeConfig {
            drain_order: vec![ResourceKind::Context, ResourceKind::Context, ResourceKind::Event],
            ..LifetimeConfig::permissive()
        };

        let order = config.effective_drain_order();
        assert_eq!(order.len(), ResourceKind::COUNT);
        assert_eq!(order[0], ResourceKind::Context);
        assert_eq!(order[1], ResourceKind::Event);
        assert_eq!(order[2], ResourceKind::Platform);
    }
}

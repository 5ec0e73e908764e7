use std::env;

/// Runtime configuration for one engine, fixed at construction.
///
/// The three `backout_*` switches disable individual clauses of the transition
/// decision table; they exist for compatibility with historical behavior and
/// default to off. `parallel` selects the rayon path for the per-column and
/// per-context fan-out regions, `verify` enables structural table checks
/// around every processing step.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub backout_invalid_neq_ft: bool,
    pub backout_eq_invalid_invalid: bool,
    pub backout_nveq_ft: bool,
    pub parallel: bool,
    pub verify: bool,
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}

impl EngineConfig {
    /// Read the legacy environment switches into a config record.
    pub fn from_env() -> Self {
        EngineConfig {
            backout_invalid_neq_ft: env_flag("PSP_BACKOUT_INVALID_NEQ_FT"),
            backout_eq_invalid_invalid: env_flag("PSP_BACKOUT_EQ_INVALID_INVALID"),
            backout_nveq_ft: env_flag("PSP_BACKOUT_NVEQ_FT"),
            parallel: env_flag("PSP_PARALLEL_FOR"),
            verify: env_flag("PSP_GNODE_VERIFY"),
        }
    }
}

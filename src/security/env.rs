//! Environment scrubbing for worker processes.
//!
//! In sandboxed mode each inherited variable is checked against two
//! pattern lists: an allow-pattern match always keeps it, otherwise a
//! block-pattern match drops it, otherwise it passes through. Patterns use
//! a single wildcard, `*`, and are matched case-insensitively against the
//! whole name.

use std::collections::BTreeMap;

use regex::Regex;

use super::{EnvMode, SecuritySettings};
use crate::{AppError, Result};

/// Variable injected into every worker describing the active policy.
pub const POLICY_ENV_VAR: &str = "SHEPHERD_ENV_POLICY";

/// A compiled `*`-glob over environment variable names.
#[derive(Debug, Clone)]
pub struct EnvPattern {
    raw: String,
    regex: Regex,
}

impl EnvPattern {
    /// Compile a glob such as `AWS_*` into an anchored matcher.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern is empty or the generated
    /// expression fails to compile.
    pub fn compile(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("empty environment pattern".into()));
        }
        let body = trimmed
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?i)^{body}$"))
            .map_err(|err| AppError::Config(format!("invalid env pattern {raw:?}: {err}")))?;
        Ok(Self {
            raw: trimmed.to_owned(),
            regex,
        })
    }

    /// Whether `name` matches the whole pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Compiled form of the environment half of [`SecuritySettings`].
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    mode: EnvMode,
    allow: Vec<EnvPattern>,
    block: Vec<EnvPattern>,
}

impl EnvPolicy {
    /// Compile the pattern lists of `settings`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern is invalid.
    pub fn compile(settings: &SecuritySettings) -> Result<Self> {
        let allow = settings
            .env_always_pass
            .iter()
            .map(|p| EnvPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let block = settings
            .env_blocklist
            .iter()
            .map(|p| EnvPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mode: settings.env_mode,
            allow,
            block,
        })
    }

    /// Whether a variable called `name` survives the policy.
    #[must_use]
    pub fn keeps(&self, name: &str) -> bool {
        match self.mode {
            EnvMode::Unrestricted => true,
            EnvMode::Sandboxed => {
                self.allow.iter().any(|p| p.matches(name))
                    || !self.block.iter().any(|p| p.matches(name))
            }
        }
    }

    /// Value of [`POLICY_ENV_VAR`], e.g. `mode=sandboxed;blocked=AWS_*,*_TOKEN`.
    #[must_use]
    pub fn descriptor(&self) -> String {
        match self.mode {
            EnvMode::Unrestricted => format!("mode={}", self.mode.as_str()),
            EnvMode::Sandboxed => {
                let blocked = self
                    .block
                    .iter()
                    .map(EnvPattern::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("mode={};blocked={blocked}", self.mode.as_str())
            }
        }
    }

    /// Filter `inherited` and add the policy descriptor.
    pub fn scrub<I, K, V>(&self, inherited: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env: BTreeMap<String, String> = inherited
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| self.keeps(k))
            .collect();
        env.insert(POLICY_ENV_VAR.to_owned(), self.descriptor());
        env
    }
}

/// Build a worker environment: scrubbed inheritance, then `injected`, then
/// caller `extra` entries, each layer overriding the previous one.
pub fn compose<I, K, V>(
    policy: &EnvPolicy,
    inherited: I,
    injected: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env = policy.scrub(inherited);
    env.extend(injected.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

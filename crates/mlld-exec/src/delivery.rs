// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parameter delivery: how bound values reach an external process.
//!
//! Nothing ever rides in `argv`. Values at or under [`INLINE_LIMIT`] are
//! exported as `MLLD_IN_<NAME>` environment variables; anything larger is
//! shipped over stdin as a JSON object the language prelude merges in. The
//! split keeps the environment block small while staying immune to `E2BIG`.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::Param;

/// Threshold under which a value may be inlined (into the environment or,
/// for the interpolator, into command text): 64 KiB.
pub const INLINE_LIMIT: usize = 64 * 1024;

/// Environment variable prefix for delivered parameters.
pub const ENV_PREFIX: &str = "MLLD_IN_";

/// Split of a parameter list into env-delivered and stdin-delivered values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamDelivery {
    /// `MLLD_IN_<NAME>` entries for small values.
    pub env: BTreeMap<String, String>,
    /// JSON object shipped over stdin for large values; `None` when every
    /// value fit in the environment.
    pub stdin_payload: Option<String>,
}

impl ParamDelivery {
    /// Plan delivery for `params`.
    #[must_use]
    pub fn plan(params: &[Param]) -> Self {
        let mut env = BTreeMap::new();
        let mut large = serde_json::Map::new();
        for param in params {
            if param.value.len() <= INLINE_LIMIT {
                env.insert(env_name(&param.name), param.value.clone());
            } else {
                large.insert(
                    param.name.clone(),
                    serde_json::Value::String(param.value.clone()),
                );
            }
        }
        let stdin_payload = if large.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(large).to_string())
        };
        Self { env, stdin_payload }
    }
}

/// The environment variable name for a parameter. The parameter name is
/// kept verbatim so the callee-side prelude can round-trip it.
#[must_use]
pub fn env_name(param: &str) -> String {
    format!("{ENV_PREFIX}{param}")
}

/// Pick a heredoc tag that does not collide with `content`.
///
/// Starts with `MLLD_EOF` and appends uuid-derived suffixes until the tag
/// appears nowhere in the content.
#[must_use]
pub fn heredoc_tag(content: &str) -> String {
    let mut tag = "MLLD_EOF".to_string();
    while content.contains(&tag) {
        tag = format!("MLLD_EOF_{}", Uuid::new_v4().simple());
    }
    tag
}

/// Render a quoted heredoc feeding `content` to `var`.
#[must_use]
pub fn wrap_heredoc(var: &str, content: &str) -> String {
    let tag = heredoc_tag(content);
    let newline = if content.ends_with('\n') { "" } else { "\n" };
    format!("{var}=$(cat <<'{tag}'\n{content}{newline}{tag}\n)")
}

//! Variable scopes and the brace-reference templating engine.
//!
//! Every piece of per-run configuration in uprez travels through a
//! [`VarScope`]: an ordered `key -> value` string mapping that supports
//! scoped copies, merge-with-policy, immediate environment expansion on
//! insert, and recursive resolution of `{...}` references.
//!
//! # Reference syntax
//!
//! A value (or command line, or path template) may reference other variables
//! with braces, and references nest from the inside out:
//!
//! ```text
//! uprez.esr.model = {esrgan.model.{transform.input.filename}}
//! ```
//!
//! The inner `{transform.input.filename}` span is resolved first; the
//! substituted text then forms the outer key. A value may itself contain
//! further references (chained indirection), which keep being expanded until
//! no span remains.
//!
//! # Failure semantics
//!
//! Resolution is all-or-nothing: a reference to a key the scope does not
//! contain fails with [`VarError::Unresolved`], carrying the best-effort
//! partially substituted text. Mutually referential values cannot converge
//! and fail closed with [`VarError::Cycle`] after a fixed number of passes
//! instead of looping forever.
//!
//! # The `.input` / `.output` convention
//!
//! Pipeline nodes discover the files a process touches purely by key
//! convention: every entry whose key ends in `.input` or `.output`
//! contributes its value to [`VarScope::inputs`] / [`VarScope::outputs`].
//! Configuration authors rely on this contract; there is deliberately no
//! richer declarative schema.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;


/// Upper bound on full substitution passes before resolution fails closed.
///
/// Each pass substitutes every resolvable reference in the text, so any
/// legitimate chain of indirections terminates well below this. Only a
/// self- or mutually-referential variable pair keeps making "progress"
/// indefinitely, and the bound converts that into [`VarError::Cycle`].
const MAX_RESOLVE_PASSES: usize = 32;

/// Errors produced while parsing assignments or resolving references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VarError {
    /// A `{key}` reference names a variable the scope does not contain.
    ///
    /// `partial` holds the text with every resolvable reference already
    /// substituted, which is what the original template had become when
    /// resolution stopped.
    #[error("unresolved variable reference '{{{key}}}' in \"{partial}\"")]
    Unresolved {
        /// The missing key.
        key: String,
        /// Best-effort partially resolved text.
        partial: String,
    },

    /// Substitution kept rewriting the text without ever converging.
    #[error("variable resolution did not converge for \"{text}\" (reference cycle?)")]
    Cycle {
        /// The text as it looked when the pass limit was hit.
        text: String,
    },

    /// An entry of a `key=value;key=value` list is missing its `=`.
    #[error("malformed variable assignment '{entry}' (expected key=value)")]
    InvalidAssignment {
        /// The offending segment.
        entry: String,
    },
}

/// An ordered, ownership-isolated mapping of variable names to string values.
///
/// Scopes are cheap to copy (`Clone` produces a deep, independent copy) and
/// are threaded through a pipeline run: the root scope seeds stage input
/// scopes, stages seed process scopes, and process scopes are merged back
/// into the next stage's input. Mutating a child never affects its parent.
///
/// Iteration order is the sorted key order, which makes [`merge`](Self::merge)
/// and the derived hashes deterministic regardless of insertion history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarScope {
    vars: BTreeMap<String, String>,
}

impl VarScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `;`-delimited `key=value` list (the CLI `--vars` format).
    ///
    /// Empty segments are ignored, so trailing separators are harmless.
    /// Values are environment-expanded on insert, like every other `add`.
    pub fn from_assignments(list: &str) -> Result<Self, VarError> {
        let mut scope = Self::new();
        for entry in list.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                return Err(VarError::InvalidAssignment { entry: entry.to_string() });
            };
            scope.add(key.trim(), value, true);
        }
        Ok(scope)
    }

    /// Inserts `key = value`, expanding environment variables in `value`
    /// immediately.
    ///
    /// If the key already exists and `overwrite` is `false` the call is a
    /// no-op. Returns whether the value was applied.
    pub fn add(&mut self, key: &str, value: &str, overwrite: bool) -> bool {
        if !overwrite && self.vars.contains_key(key) {
            return false;
        }
        self.vars.insert(key.to_string(), expand_env(value));
        true
    }

    /// Applies [`add`](Self::add) for every entry of `other`, in `other`'s
    /// iteration order, each subject to the same overwrite policy.
    pub fn merge(&mut self, other: &VarScope, overwrite: bool) {
        for (key, value) in &other.vars {
            self.add(key, value, overwrite);
        }
    }

    /// Exact lookup without resolution.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Whether the scope contains `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Number of entries in the scope.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the scope has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Resolves every `{...}` reference in `text` against this scope.
    ///
    /// Innermost spans are substituted first, so nested references like
    /// `{a.{b}.c}` work: `{b}` is replaced, and the rewritten outer span is
    /// looked up on the next pass. Substitution is textual and replaces all
    /// occurrences of a reference at once. A key may legally resolve to an
    /// empty string.
    ///
    /// # Errors
    ///
    /// [`VarError::Unresolved`] if a brace-free key is absent from the scope,
    /// [`VarError::Cycle`] if substitution fails to converge.
    pub fn try_resolve(&self, text: &str) -> Result<String, VarError> {
        let mut text = text.to_string();
        for _ in 0..MAX_RESOLVE_PASSES {
            let keys = Self::extract_vars(&text);
            if keys.is_empty() {
                return Ok(text);
            }

            let mut substituted = false;
            for key in &keys {
                if key.contains('{') || key.contains('}') {
                    // Still carries an unexpanded inner reference; it becomes
                    // a plain key once the inner span is substituted.
                    continue;
                }
                match self.vars.get(key) {
                    Some(value) => {
                        let needle = format!("{{{key}}}");
                        if text.contains(&needle) {
                            text = text.replace(&needle, value);
                            substituted = true;
                        }
                    }
                    None => {
                        return Err(VarError::Unresolved { key: key.clone(), partial: text });
                    }
                }
            }

            if !substituted {
                // Only nested spans remain and none of them made progress.
                return Err(VarError::Unresolved { key: keys[0].clone(), partial: text });
            }
        }
        Err(VarError::Cycle { text })
    }

    /// [`try_resolve`](Self::try_resolve) followed by environment expansion.
    ///
    /// Convenience for filesystem path templates, where both `{...}`
    /// references and `$VAR` syntax may appear.
    pub fn resolve_path(&self, text: &str) -> Result<String, VarError> {
        Ok(expand_env(&self.try_resolve(text)?))
    }

    /// Lists every innermost `{...}` key reference in `text`, in scan order.
    ///
    /// The scan keeps an explicit stack of open-brace positions; each closing
    /// brace pops the most recent one, so for `{a.{b}.c}` the result is
    /// `["b", "a.{b}.c"]`. A closing brace with no matching opener ends the
    /// scan. Non-destructive: used to validate configuration without
    /// executing anything.
    #[must_use]
    pub fn extract_vars(text: &str) -> Vec<String> {
        let mut stack: Vec<usize> = Vec::new();
        let mut keys = Vec::new();
        for (i, b) in text.bytes().enumerate() {
            match b {
                b'{' => stack.push(i),
                b'}' => match stack.pop() {
                    Some(start) => keys.push(text[start + 1..i].to_string()),
                    None => break,
                },
                _ => {}
            }
        }
        keys
    }

    /// Whether at least one well-formed `{...}` span exists in `text`.
    #[must_use]
    pub fn contains_vars(text: &str) -> bool {
        !Self::extract_vars(text).is_empty()
    }

    /// Values of every entry whose key ends with `.input`.
    #[must_use]
    pub fn inputs(&self) -> BTreeSet<String> {
        self.values_with_suffix(".input")
    }

    /// Values of every entry whose key ends with `.output`.
    #[must_use]
    pub fn outputs(&self) -> BTreeSet<String> {
        self.values_with_suffix(".output")
    }

    fn values_with_suffix(&self, suffix: &str) -> BTreeSet<String> {
        self.vars
            .iter()
            .filter(|(key, _)| key.ends_with(suffix))
            .map(|(_, value)| value.clone())
            .collect()
    }
}

/// Expands `$VAR` / `${VAR}` environment references, leaving undefined
/// variables untouched.
fn expand_env(text: &str) -> String {
    shellexpand::env_with_context_no_errors(text, |name| std::env::var(name).ok()).into_owned()
}

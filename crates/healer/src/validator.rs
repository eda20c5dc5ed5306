//! Safety gate for AI-proposed file edits.
//!
//! Every proposal passes through [`ChangeValidator::validate`] before anything
//! touches source control. Two checks run per edit:
//! - path: must match an allow pattern and no deny pattern (deny wins)
//! - content: scanned for dangerous signatures (process execution, dynamic
//!   evaluation, destructive filesystem calls, environment mutation, forced
//!   shell deletion)
//!
//! The first offending edit rejects the whole batch.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

use crate::types::ProposedEdit;

/// Application source trees and specific named config files.
static DEFAULT_ALLOW: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(
            r"^(?:src|app|pages|components|lib|utils|hooks|styles|public|api|server|services|routes|views|templates|static|assets|tests?|__tests__)/.+\.(?:js|jsx|ts|tsx|mjs|cjs|vue|svelte|astro|css|scss|sass|less|html|json|md|mdx|py|rb|go|rs|svg)$",
        )
        .unwrap(),
        Regex::new(r"^(?:index|server|app|main)\.(?:js|jsx|ts|tsx|mjs|cjs|py)$").unwrap(),
        Regex::new(
            r"^(?:package\.json|tsconfig(?:\.[\w-]+)?\.json|jsconfig\.json|vercel\.json|netlify\.toml|requirements\.txt|pyproject\.toml|Cargo\.toml|go\.mod|\.babelrc|\.eslintrc(?:\.(?:js|cjs|json))?|\.prettierrc(?:\.json)?)$",
        )
        .unwrap(),
        Regex::new(
            r"^(?:next|vite|nuxt|svelte|astro|tailwind|postcss|babel|webpack|rollup|jest|vitest)\.config\.(?:js|cjs|mjs|ts|json)$",
        )
        .unwrap(),
    ]
});

/// Secrets, version-control internals, dependency and build output.
static DEFAULT_DENY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?:^|/)\.env(?:\.[^/]*)?$").unwrap(),
        Regex::new(r"(?:^|/)\.git(?:/|$)").unwrap(),
        Regex::new(r"(?:^|/)\.github/workflows/").unwrap(),
        Regex::new(r"(?:^|/)node_modules/").unwrap(),
        Regex::new(
            r"(?:^|/)(?:dist|build|out|target|coverage|\.next|\.nuxt|\.vercel|\.netlify|\.output|__pycache__)/",
        )
        .unwrap(),
        Regex::new(
            r"(?:^|/)(?:package-lock\.json|yarn\.lock|pnpm-lock\.yaml|Cargo\.lock)$",
        )
        .unwrap(),
        Regex::new(r"\.(?:pem|key|p12|pfx|crt|cer|keystore|jks)$").unwrap(),
        Regex::new(r"(?:^|/)(?:id_rsa|id_ed25519|\.npmrc|\.pypirc|\.netrc|\.htpasswd)$").unwrap(),
        Regex::new(r"(?:^|/)(?:secrets?|credentials)(?:[./]|$)").unwrap(),
    ]
});

/// Category of a dangerous content signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCategory {
    ProcessExecution,
    DynamicEvaluation,
    DestructiveFilesystem,
    EnvironmentMutation,
    ForcedShellDeletion,
}

impl DangerCategory {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::ProcessExecution => "process/shell execution",
            Self::DynamicEvaluation => "dynamic code evaluation",
            Self::DestructiveFilesystem => "destructive filesystem call",
            Self::EnvironmentMutation => "environment variable mutation",
            Self::ForcedShellDeletion => "forced shell deletion",
        }
    }
}

struct DangerPattern {
    category: DangerCategory,
    regex: Regex,
}

/// Patterns run over the whole file, so `\s` also spans line breaks.
fn danger(category: DangerCategory, pattern: &str) -> DangerPattern {
    DangerPattern {
        category,
        regex: Regex::new(&format!("(?m){pattern}")).unwrap(),
    }
}

static DANGEROUS: LazyLock<Vec<DangerPattern>> = LazyLock::new(|| {
    use DangerCategory::{
        DestructiveFilesystem, DynamicEvaluation, EnvironmentMutation, ForcedShellDeletion,
        ProcessExecution,
    };
    vec![
        danger(ProcessExecution, r"\bchild_process\b"),
        danger(
            ProcessExecution,
            r"(?:^|[^.\w])(?:exec|execSync|execFile|execFileSync|spawn|spawnSync|fork)\s*\(",
        ),
        danger(ProcessExecution, r"\bos\.(?:system|popen|exec[lv]p?e?)\s*\("),
        danger(ProcessExecution, r"\bsubprocess\.\w+"),
        danger(ProcessExecution, r"\bprocess::Command\b"),
        danger(ProcessExecution, r"\b(?:Deno\.run|Bun\.spawn)\b"),
        danger(DynamicEvaluation, r"\beval\b\s*[()]"),
        danger(DynamicEvaluation, r"\bFunction\s*\("),
        danger(DynamicEvaluation, r#"\[\s*['"`](?:eval|Function)['"`]\s*\]"#),
        danger(DynamicEvaluation, r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#),
        danger(
            DynamicEvaluation,
            r"\bvm\.(?:runInNewContext|runInThisContext|runInContext|Script)\b",
        ),
        danger(
            DestructiveFilesystem,
            r"\bfs(?:\.promises)?\.(?:rm|rmSync|rmdir|rmdirSync|unlink|unlinkSync)\s*\(",
        ),
        danger(DestructiveFilesystem, r"\brimraf\b"),
        danger(DestructiveFilesystem, r"\bshutil\.rmtree\b"),
        danger(DestructiveFilesystem, r"\bos\.(?:remove|unlink|rmdir)\s*\("),
        danger(DestructiveFilesystem, r"\bremove_dir_all\b"),
        danger(
            EnvironmentMutation,
            r"\bprocess\.env(?:\.\w+|\[[^\]]+\])\s*(?:[-+*/%?|&]{1,2}|<<|>>>?)?=[^=]",
        ),
        danger(
            EnvironmentMutation,
            r"\b(?:Object\.(?:assign|defineProperty|defineProperties)|Reflect\.(?:set|defineProperty|deleteProperty))\s*\(\s*process\.env\b",
        ),
        danger(EnvironmentMutation, r"\bdelete\s+process\.env\b"),
        danger(EnvironmentMutation, r"\bos\.environ\[[^\]]+\]\s*=[^=]"),
        danger(EnvironmentMutation, r"\bos\.(?:putenv|unsetenv)\s*\("),
        danger(EnvironmentMutation, r"\benv::(?:set_var|remove_var)\b"),
        danger(ForcedShellDeletion, r"\brm\s+-(?:[a-zA-Z]*r[a-zA-Z]*f|[a-zA-Z]*f[a-zA-Z]*r)\b"),
        danger(
            ForcedShellDeletion,
            r"\brm\s+(?:-r\s+-f|-f\s+-r|--recursive\s+--force|--force\s+--recursive)\b",
        ),
    ]
});

/// Why a proposal was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    EmptyProposal,
    TooManyFiles,
    DuplicatePath,
    UnsafePath,
    DeniedPath,
    PathNotAllowed,
    ContentTooLarge,
    DangerousContent,
}

/// A refused proposal, naming the offending file.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{path}: {reason}")]
pub struct ChangeRejection {
    pub path: String,
    pub kind: RejectionKind,
    pub reason: String,
}

impl ChangeRejection {
    fn new(path: &str, kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            kind,
            reason: reason.into(),
        }
    }
}

/// One dangerous signature found in file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFinding {
    pub category: DangerCategory,
    /// 1-based line
    pub line: usize,
    /// The matched text
    pub matched: String,
}

/// Tunables for the validator; patterns are added to the built-in lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorPolicy {
    pub extra_allow: Vec<String>,
    pub extra_deny: Vec<String>,
    pub max_files: usize,
    pub max_file_bytes: usize,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            extra_allow: Vec::new(),
            extra_deny: Vec::new(),
            max_files: 20,
            max_file_bytes: 256 * 1024,
        }
    }
}

/// Pure, synchronous gate over proposed edits.
#[derive(Debug, Clone)]
pub struct ChangeValidator {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    max_files: usize,
    max_file_bytes: usize,
}

impl Default for ChangeValidator {
    fn default() -> Self {
        Self {
            allow: DEFAULT_ALLOW.clone(),
            deny: DEFAULT_DENY.clone(),
            max_files: ValidatorPolicy::default().max_files,
            max_file_bytes: ValidatorPolicy::default().max_file_bytes,
        }
    }
}

impl ChangeValidator {
    /// Build a validator from the built-in lists plus `policy`.
    ///
    /// # Errors
    ///
    /// Returns an error if an extra pattern is not a valid regex.
    pub fn with_policy(policy: &ValidatorPolicy) -> Result<Self, regex::Error> {
        let mut validator = Self::default();
        for pattern in &policy.extra_allow {
            validator.allow.push(Regex::new(pattern)?);
        }
        for pattern in &policy.extra_deny {
            validator.deny.push(Regex::new(pattern)?);
        }
        validator.max_files = policy.max_files;
        validator.max_file_bytes = policy.max_file_bytes;
        Ok(validator)
    }

    /// Accept or reject a batch of edits.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChangeRejection`] found; a rejected batch is never
    /// partially applicable.
    pub fn validate(&self, edits: &[ProposedEdit]) -> Result<(), ChangeRejection> {
        if edits.is_empty() {
            return Err(ChangeRejection::new(
                "",
                RejectionKind::EmptyProposal,
                "proposal contains no edits",
            ));
        }
        if edits.len() > self.max_files {
            return Err(ChangeRejection::new(
                "",
                RejectionKind::TooManyFiles,
                format!("{} files proposed, limit is {}", edits.len(), self.max_files),
            ));
        }

        let mut seen = HashSet::new();
        for edit in edits {
            let path = self.check_path(&edit.path)?;
            if !seen.insert(path.clone()) {
                return Err(ChangeRejection::new(
                    &edit.path,
                    RejectionKind::DuplicatePath,
                    "path appears more than once in the proposal",
                ));
            }
            self.check_content(&path, &edit.new_content)?;
        }
        Ok(())
    }

    /// Validate one path; returns its normalized form.
    pub fn check_path(&self, raw: &str) -> Result<String, ChangeRejection> {
        let path = normalize_path(raw).ok_or_else(|| {
            ChangeRejection::new(
                raw,
                RejectionKind::UnsafePath,
                "path must be relative to the repository root without '..' segments",
            )
        })?;

        if let Some(rule) = self.deny.iter().find(|r| r.is_match(&path)) {
            return Err(ChangeRejection::new(
                raw,
                RejectionKind::DeniedPath,
                format!("path matches deny rule `{}`", rule.as_str()),
            ));
        }

        if !self.allow.iter().any(|r| r.is_match(&path)) {
            return Err(ChangeRejection::new(
                raw,
                RejectionKind::PathNotAllowed,
                "path is outside the editable source tree",
            ));
        }

        Ok(path)
    }

    fn check_content(&self, path: &str, content: &str) -> Result<(), ChangeRejection> {
        if content.len() > self.max_file_bytes {
            return Err(ChangeRejection::new(
                path,
                RejectionKind::ContentTooLarge,
                format!(
                    "content is {} bytes, limit is {}",
                    content.len(),
                    self.max_file_bytes
                ),
            ));
        }

        if let Some(finding) = scan_content(content).into_iter().next() {
            return Err(ChangeRejection::new(
                path,
                RejectionKind::DangerousContent,
                format!(
                    "{} (`{}`) at line {}",
                    finding.category.describe(),
                    finding.matched,
                    finding.line
                ),
            ));
        }
        Ok(())
    }
}

/// Find every dangerous signature in `content`, in file order.
#[must_use]
pub fn scan_content(content: &str) -> Vec<ContentFinding> {
    let mut hits = Vec::new();
    for pattern in DANGEROUS.iter() {
        for m in pattern.regex.find_iter(content) {
            let text = m.as_str();
            let offset = m.start() + (text.len() - text.trim_start().len());
            hits.push((offset, pattern.category, text));
        }
    }
    hits.sort_by_key(|(offset, _, _)| *offset);

    hits.into_iter()
        .map(|(offset, category, text)| ContentFinding {
            category,
            line: content[..offset].matches('\n').count() + 1,
            matched: truncate(&text.split_whitespace().collect::<Vec<_>>().join(" "), 80),
        })
        .collect()
}

/// Normalize separators and reject absolute or escaping paths.
fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty()
        || unified.starts_with('/')
        || unified.starts_with('~')
        || unified.contains('\0')
        || unified.as_bytes().get(1) == Some(&b':')
    {
        return None;
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push('…');
        out
    }
}

//! Trust gating for scripts.
//!
//! Every script path gets a `PermissionRecord` keyed to a SHA-256 of its
//! content. A record is only evidence of trust while the stored hash
//! matches what is on disk now; any change drops trust until a human
//! approves again.
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Stored trust decision for one script path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRecord {
    /// Content fingerprint at the last observation
    pub hash: String,
    #[serde(default)]
    pub trusted: bool,
    pub last_modified: DateTime<Utc>,
    /// Capability tags. Only membership is ever checked.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl PermissionRecord {
    fn observed(hash: String, trusted: bool) -> Self {
        Self {
            hash,
            trusted,
            last_modified: Utc::now(),
            permissions: BTreeSet::new(),
        }
    }
}

/// What a human needs to see before approving a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    /// False when `errors` is non-empty. Warnings alone keep a script safe.
    pub safe: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Approval prompt for a script: warnings from a static content scan.
    pub fn for_content(content: &str) -> Self {
        Self {
            safe: true,
            warnings: scan_content(content),
            errors: Vec::new(),
        }
    }

    /// A refusal no approval can lift.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            safe: false,
            warnings: Vec::new(),
            errors: vec![error.into()],
        }
    }

    fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.insert(0, warning.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    ApprovalRequired,
    ScriptModified,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ApprovalRequired => write!(f, "approval required"),
            DenyReason::ScriptModified => write!(f, "script modified since approval"),
        }
    }
}

/// Outcome of `TrustRegistry::authorize`.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Allowed,
    Denied {
        reason: DenyReason,
        validation: ValidationResult,
    },
}

#[cfg(test)]
impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

/// Per-path permission records plus the approval policy.
///
/// Owned by the engine; all mutation goes through `authorize` and the
/// explicit administrative calls (`approve`, `revoke`, `remove`, `grant`).
#[derive(Debug, Clone)]
pub struct TrustRegistry {
    records: HashMap<String, PermissionRecord>,
    require_approval: bool,
}

impl TrustRegistry {
    pub fn new(require_approval: bool, records: HashMap<String, PermissionRecord>) -> Self {
        Self {
            records,
            require_approval,
        }
    }

    /// Decides whether `script_path` may run with its current `content`.
    ///
    /// Always records the latest hash and observation time, whatever the
    /// outcome. Only `trusted` is gated by policy.
    pub fn authorize(&mut self, script_path: &str, content: &[u8]) -> Authorization {
        let hash = fingerprint(content);

        let Some(record) = self.records.get_mut(script_path) else {
            let trusted = !self.require_approval;
            self.records.insert(
                script_path.to_string(),
                PermissionRecord::observed(hash, trusted),
            );
            if trusted {
                info!("Trusting {script_path} implicitly (approval not required)");
                return Authorization::Allowed;
            }
            warn!("Unknown script {script_path}: approval required");
            return Authorization::Denied {
                reason: DenyReason::ApprovalRequired,
                validation: ValidationResult::for_content(&String::from_utf8_lossy(content)),
            };
        };

        let changed = record.hash != hash;
        record.hash = hash;
        record.last_modified = Utc::now();

        if changed {
            record.trusted = false;
            warn!("Script {script_path} changed since approval, trust revoked");
            return Authorization::Denied {
                reason: DenyReason::ScriptModified,
                validation: ValidationResult::for_content(&String::from_utf8_lossy(content))
                    .with_warning("script content changed since it was last approved"),
            };
        }

        if record.trusted {
            debug!("Script {script_path} trusted");
            return Authorization::Allowed;
        }

        if !self.require_approval {
            record.trusted = true;
            info!("Trusting {script_path} implicitly (approval not required)");
            return Authorization::Allowed;
        }

        warn!("Script {script_path} not approved yet");
        Authorization::Denied {
            reason: DenyReason::ApprovalRequired,
            validation: ValidationResult::for_content(&String::from_utf8_lossy(content)),
        }
    }

    /// Explicit human approval of `content` as it is now.
    pub fn approve(&mut self, script_path: &str, content: &[u8]) {
        let hash = fingerprint(content);
        let record = self
            .records
            .entry(script_path.to_string())
            .or_insert_with(|| PermissionRecord::observed(hash.clone(), false));
        record.hash = hash;
        record.trusted = true;
        record.last_modified = Utc::now();
        info!("Approved {script_path}");
    }

    /// Clears trust but keeps the record. Returns false for unknown paths.
    pub fn revoke(&mut self, script_path: &str) -> bool {
        match self.records.get_mut(script_path) {
            Some(record) => {
                record.trusted = false;
                info!("Revoked trust for {script_path}");
                true
            }
            None => false,
        }
    }

    /// Deletes the record outright.
    pub fn remove(&mut self, script_path: &str) -> Option<PermissionRecord> {
        let removed = self.records.remove(script_path);
        if removed.is_some() {
            info!("Removed permission record for {script_path}");
        }
        removed
    }

    /// Adds a capability tag. Returns false for unknown paths.
    pub fn grant(&mut self, script_path: &str, permission: &str) -> bool {
        match self.records.get_mut(script_path) {
            Some(record) => {
                record.permissions.insert(permission.to_string());
                true
            }
            None => false,
        }
    }

    pub fn has_permission(&self, script_path: &str, permission: &str) -> bool {
        self.records
            .get(script_path)
            .is_some_and(|r| r.permissions.contains(permission))
    }

    #[cfg(test)]
    pub fn get(&self, script_path: &str) -> Option<&PermissionRecord> {
        self.records.get(script_path)
    }

    pub fn records(&self) -> &HashMap<String, PermissionRecord> {
        &self.records
    }
}

/// SHA-256 of script content, hex encoded.
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Whether `script_path` lives under one of the `allowed` prefixes.
///
/// Matching is per path component; an empty list allows everything.
pub fn path_allowed(script_path: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let path = Path::new(script_path);
    allowed
        .iter()
        .map(|prefix| prefix.trim_matches('/'))
        .any(|prefix| prefix.is_empty() || path.starts_with(prefix))
}

/// Constructs worth flagging in an approval prompt.
const RISKY_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf", "deletes files recursively (rm -rf)"),
    ("shutil.rmtree", "deletes files recursively (shutil.rmtree)"),
    ("os.system", "runs shell commands (os.system)"),
    ("subprocess", "spawns processes (subprocess)"),
    ("child_process", "spawns processes (child_process)"),
    ("eval(", "evaluates dynamic code (eval)"),
    ("exec(", "executes dynamic code (exec)"),
    ("sudo ", "escalates privileges (sudo)"),
    ("curl ", "downloads from the network (curl)"),
    ("wget ", "downloads from the network (wget)"),
    ("requests.", "makes HTTP requests (requests)"),
    ("urllib", "makes HTTP requests (urllib)"),
    ("socket", "opens network sockets"),
];

/// Static scan for risky constructs. Each hit yields one warning.
pub fn scan_content(content: &str) -> Vec<String> {
    RISKY_PATTERNS
        .iter()
        .filter(|(needle, _)| content.contains(needle))
        .map(|(_, what)| format!("script {what}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &[u8] = b"print('hello')\n";

    fn registry(require_approval: bool) -> TrustRegistry {
        TrustRegistry::new(require_approval, HashMap::new())
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(fingerprint(b"a"), fingerprint(b"b"));
    }

    #[test]
    fn test_unknown_script_requires_approval() {
        let mut reg = registry(true);
        match reg.authorize("scripts/a.py", SCRIPT) {
            Authorization::Denied { reason, validation } => {
                assert_eq!(reason, DenyReason::ApprovalRequired);
                assert!(validation.safe);
                assert!(validation.errors.is_empty());
            }
            other => panic!("Expected denial, got {other:?}"),
        }
        let record = reg.get("scripts/a.py").unwrap();
        assert!(!record.trusted);
        assert_eq!(record.hash, fingerprint(SCRIPT));
    }

    #[test]
    fn test_unknown_script_implicitly_trusted_without_approval() {
        let mut reg = registry(false);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
        assert!(reg.get("a.py").unwrap().trusted);
    }

    #[test]
    fn test_approve_then_allowed() {
        let mut reg = registry(true);
        assert!(!reg.authorize("a.py", SCRIPT).is_allowed());
        reg.approve("a.py", SCRIPT);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
    }

    #[test]
    fn test_authorize_idempotent_when_trusted() {
        let mut reg = registry(true);
        reg.approve("a.py", SCRIPT);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
        assert!(reg.get("a.py").unwrap().trusted);
    }

    #[test]
    fn test_modified_script_loses_trust() {
        let mut reg = registry(true);
        reg.approve("a.py", SCRIPT);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());

        let modified = b"import os\nos.system('rm -rf ~')\n";
        match reg.authorize("a.py", modified) {
            Authorization::Denied { reason, validation } => {
                assert_eq!(reason, DenyReason::ScriptModified);
                assert!(validation.warnings[0].contains("changed"));
                assert!(validation.warnings.iter().any(|w| w.contains("os.system")));
            }
            other => panic!("Expected denial, got {other:?}"),
        }
        let record = reg.get("a.py").unwrap();
        assert!(!record.trusted);
        assert_eq!(record.hash, fingerprint(modified));

        // Same (modified) content again: still needs approval
        match reg.authorize("a.py", modified) {
            Authorization::Denied { reason, .. } => {
                assert_eq!(reason, DenyReason::ApprovalRequired)
            }
            other => panic!("Expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_modified_script_denied_once_without_approval() {
        let mut reg = registry(false);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
        assert!(!reg.authorize("a.py", b"print(2)").is_allowed());
        assert!(reg.authorize("a.py", b"print(2)").is_allowed());
    }

    #[test]
    fn test_authorize_updates_observation_on_denial() {
        let mut reg = registry(true);
        reg.authorize("a.py", SCRIPT);
        let first = reg.get("a.py").unwrap().last_modified;
        reg.authorize("a.py", b"other");
        let record = reg.get("a.py").unwrap();
        assert!(record.last_modified >= first);
        assert_eq!(record.hash, fingerprint(b"other"));
    }

    #[test]
    fn test_preloaded_records_are_honored() {
        let mut records = HashMap::new();
        records.insert(
            "a.py".to_string(),
            PermissionRecord {
                hash: fingerprint(SCRIPT),
                trusted: true,
                last_modified: Utc::now(),
                permissions: BTreeSet::new(),
            },
        );
        let mut reg = TrustRegistry::new(true, records);
        assert!(reg.authorize("a.py", SCRIPT).is_allowed());
    }

    #[test]
    fn test_revoke_keeps_record() {
        let mut reg = registry(true);
        reg.approve("a.py", SCRIPT);
        assert!(reg.revoke("a.py"));
        assert!(!reg.get("a.py").unwrap().trusted);
        assert!(!reg.authorize("a.py", SCRIPT).is_allowed());
        assert!(!reg.revoke("missing.py"));
    }

    #[test]
    fn test_remove_is_explicit() {
        let mut reg = registry(true);
        reg.approve("a.py", SCRIPT);
        assert!(reg.remove("a.py").is_some());
        assert!(reg.get("a.py").is_none());
        assert!(reg.remove("a.py").is_none());
    }

    #[test]
    fn test_permission_tags_membership() {
        let mut reg = registry(true);
        assert!(!reg.grant("a.py", "network"));
        reg.approve("a.py", SCRIPT);
        assert!(reg.grant("a.py", "network"));
        assert!(reg.has_permission("a.py", "network"));
        assert!(!reg.has_permission("a.py", "filesystem"));
        assert!(!reg.has_permission("b.py", "network"));
    }

    #[test]
    fn test_path_allowed() {
        let allowed = vec!["scripts".to_string(), "/tools/".to_string()];
        assert!(path_allowed("scripts/hello.py", &allowed));
        assert!(path_allowed("tools/x/y.sh", &allowed));
        assert!(!path_allowed("scriptsevil/hello.py", &allowed));
        assert!(!path_allowed("hello.py", &allowed));
        assert!(path_allowed("anything.py", &[]));
    }

    #[test]
    fn test_scan_content() {
        assert!(scan_content("print('hi')").is_empty());
        let warnings = scan_content("import subprocess\nsubprocess.run(['curl ', 'x'])");
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("subprocess"));
        assert!(warnings[1].contains("curl"));
    }

    #[test]
    fn test_rejected_validation_is_unsafe() {
        let v = ValidationResult::rejected("outside allowed paths");
        assert!(!v.safe);
        assert_eq!(v.errors, vec!["outside allowed paths"]);
    }

    #[test]
    fn test_deny_reason_display() {
        assert_eq!(DenyReason::ApprovalRequired.to_string(), "approval required");
        assert_eq!(
            DenyReason::ScriptModified.to_string(),
            "script modified since approval"
        );
    }
}

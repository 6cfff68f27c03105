use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rulewatch_core::collaborators::AccessCheck;
use rulewatch_core::config::Layout;
use tracing::warn;

pub const OWNERS_FILE: &str = "owners";
pub const MEMBERS_FILE: &str = "members";

/// Grants access to owners and members of a tenant or any of its parents.
///
/// Both lists are JSON arrays of user names stored in the tenant's metadata
/// directory. Missing files count as empty lists.
#[derive(Debug, Clone)]
pub struct MembershipAccess {
    layout: Arc<Layout>,
}

impl MembershipAccess {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self { layout }
    }

    fn listed_in(&self, tenant: &str, owner: &str) -> bool {
        let dir = self.layout.tenant_meta_dir(tenant);
        [OWNERS_FILE, MEMBERS_FILE]
            .iter()
            .any(|name| read_names(&dir.join(name)).iter().any(|name| name == owner))
    }
}

fn read_names(path: &Path) -> Vec<String> {
    let Ok(raw) = fs::read(path) else {
        return Vec::new();
    };
    match serde_json::from_slice::<Vec<String>>(&raw) {
        Ok(names) => names,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable membership list");
            Vec::new()
        }
    }
}

/// `a/b/c`, `a/b`, `a`.
fn tenant_lineage(tenant: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(tenant);
    std::iter::from_fn(move || {
        let tenant = current?;
        current = tenant.rfind('/').map(|idx| &tenant[..idx]);
        Some(tenant)
    })
}

#[async_trait]
impl AccessCheck for MembershipAccess {
    async fn has_access(&self, owner: &str, tenant: &str) -> bool {
        if owner.is_empty() || tenant.is_empty() {
            return false;
        }
        tenant_lineage(tenant).any(|tenant| self.listed_in(tenant, owner))
    }
}

/// Access check for `access.allow_all = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessCheck for AllowAll {
    async fn has_access(&self, _owner: &str, _tenant: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_up_to_top_level() {
        let lineage: Vec<_> = tenant_lineage("a/b/c").collect();
        assert_eq!(lineage, vec!["a/b/c", "a/b", "a"]);
        assert_eq!(tenant_lineage("solo").collect::<Vec<_>>(), vec!["solo"]);
    }

    #[tokio::test]
    async fn parent_membership_grants_nested_access() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::new(tmp.path().join("meta"), tmp.path().join("files")));
        let parent = layout.tenant_meta_dir("alpha");
        fs::create_dir_all(layout.tenant_meta_dir("alpha/sub")).unwrap();
        fs::write(parent.join(OWNERS_FILE), r#"["alice"]"#).unwrap();
        fs::write(layout.tenant_meta_dir("alpha/sub").join(MEMBERS_FILE), r#"["bob"]"#).unwrap();
        fs::write(parent.join(MEMBERS_FILE), "not json").unwrap();

        let access = MembershipAccess::new(layout);
        assert!(access.has_access("alice", "alpha").await);
        assert!(access.has_access("alice", "alpha/sub").await);
        assert!(access.has_access("bob", "alpha/sub").await);
        assert!(!access.has_access("bob", "alpha").await);
        assert!(!access.has_access("mallory", "alpha/sub").await);
        assert!(!access.has_access("alice", "beta").await);
    }
}

// Access control - table-level role grants layered over row-level
// ownership checks. The actor is always an explicit value; there is no
// ambient "current user" state.

use crate::metadata::TableMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The caller identity for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: Option<i64>,
    pub role: String,
    pub ip: Option<String>,
}

impl ActorContext {
    pub fn new(role: impl Into<String>) -> Self {
        ActorContext {
            user_id: None,
            role: role.into(),
            ip: None,
        }
    }

    pub fn with_user(role: impl Into<String>, user_id: i64) -> Self {
        ActorContext {
            user_id: Some(user_id),
            role: role.into(),
            ip: None,
        }
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization decisions for one table's metadata.
pub struct PermissionManager<'m> {
    metadata: &'m TableMetadata,
}

impl<'m> PermissionManager<'m> {
    pub fn new(metadata: &'m TableMetadata) -> Self {
        PermissionManager { metadata }
    }

    /// Authorize an action. A table-level grant dominates: row-level checks
    /// are not consulted when the role is granted. With no permission
    /// metadata at all the table is open (secure by explicit configuration,
    /// not by default).
    pub fn authorize(&self, action: Action, actor: &ActorContext, record: Option<&Value>) -> bool {
        if !self.metadata.has_any_permissions() {
            return true;
        }

        if self.table_grant(action, actor) {
            return true;
        }

        // Row-level checks need a concrete record; list/create contexts
        // without one cannot be authorized row-by-row.
        let (rls, record) = match (&self.metadata.row_level_security, record) {
            (Some(rls), Some(record)) if rls.enabled => (rls, record),
            _ => return false,
        };

        if !self.owns(record, &rls.owner_field, actor) {
            return false;
        }

        match action {
            Action::Read => true,
            Action::Update => rls.owner_can_edit,
            Action::Delete => rls.owner_can_delete,
            Action::Create => false,
        }
    }

    /// Per-row read filter for list views. When a table-level read grant
    /// exists no filtering happens at all.
    pub fn filter_records(&self, records: Vec<Value>, actor: &ActorContext) -> Vec<Value> {
        if !self.metadata.has_any_permissions() || self.table_grant(Action::Read, actor) {
            return records;
        }
        records
            .into_iter()
            .filter(|record| self.authorize(Action::Read, actor, Some(record)))
            .collect()
    }

    fn table_grant(&self, action: Action, actor: &ActorContext) -> bool {
        match self.metadata.permissions.get(action.as_str()) {
            Some(roles) => roles.iter().any(|r| r == "*" || r == &actor.role),
            None => false,
        }
    }

    fn owns(&self, record: &Value, owner_field: &str, actor: &ActorContext) -> bool {
        let user_id = match actor.user_id {
            Some(id) => id,
            None => return false,
        };
        match record.get(owner_field) {
            Some(Value::Number(n)) => n.as_i64() == Some(user_id),
            Some(Value::String(s)) => s.parse::<i64>().ok() == Some(user_id),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::decode_table;
    use serde_json::json;

    fn guarded_metadata() -> TableMetadata {
        decode_table(Some(
            r#"{
                "permissions": {"read": ["guest", "admin"], "update": ["admin"], "delete": ["admin"]},
                "row_level_security": {
                    "enabled": true,
                    "owner_field": "user_id",
                    "owner_can_edit": true,
                    "owner_can_delete": false
                }
            }"#,
        ))
    }

    #[test]
    fn test_no_metadata_is_default_allow() {
        let meta = TableMetadata::default();
        let manager = PermissionManager::new(&meta);
        let actor = ActorContext::new("anyone");
        assert!(manager.authorize(Action::Delete, &actor, None));
    }

    #[test]
    fn test_table_grant_dominates_row_level_check() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        // guest has a table-level read grant; non-ownership is irrelevant
        let actor = ActorContext::with_user("guest", 99);
        let record = json!({"id": 1, "user_id": 5});
        assert!(manager.authorize(Action::Read, &actor, Some(&record)));
    }

    #[test]
    fn test_wildcard_role() {
        let meta = decode_table(Some(r#"{"permissions": {"read": ["*"]}}"#));
        let manager = PermissionManager::new(&meta);
        assert!(manager.authorize(Action::Read, &ActorContext::new("nobody"), None));
        assert!(!manager.authorize(Action::Update, &ActorContext::new("nobody"), None));
    }

    #[test]
    fn test_owner_can_read_and_edit_but_not_delete() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let owner = ActorContext::with_user("member", 5);
        let record = json!({"id": 1, "user_id": 5});

        assert!(manager.authorize(Action::Read, &owner, Some(&record)));
        assert!(manager.authorize(Action::Update, &owner, Some(&record)));
        // owner_can_delete is false
        assert!(!manager.authorize(Action::Delete, &owner, Some(&record)));
    }

    #[test]
    fn test_non_owner_denied() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let stranger = ActorContext::with_user("member", 7);
        let record = json!({"id": 1, "user_id": 5});
        assert!(!manager.authorize(Action::Update, &stranger, Some(&record)));
    }

    #[test]
    fn test_row_check_requires_record_context() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let owner = ActorContext::with_user("member", 5);
        assert!(!manager.authorize(Action::Update, &owner, None));
    }

    #[test]
    fn test_filter_records_keeps_owned_rows() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let actor = ActorContext::with_user("member", 5);
        let records = vec![
            json!({"id": 1, "user_id": 5}),
            json!({"id": 2, "user_id": 9}),
            json!({"id": 3, "user_id": 5}),
        ];
        let visible = manager.filter_records(records, &actor);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0]["id"], 1);
        assert_eq!(visible[1]["id"], 3);
    }

    #[test]
    fn test_filter_records_skips_filtering_on_table_grant() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let admin = ActorContext::with_user("admin", 1);
        let records = vec![json!({"id": 1, "user_id": 5}), json!({"id": 2, "user_id": 9})];
        assert_eq!(manager.filter_records(records, &admin).len(), 2);
    }

    #[test]
    fn test_owner_field_as_string_value() {
        let meta = guarded_metadata();
        let manager = PermissionManager::new(&meta);
        let owner = ActorContext::with_user("member", 5);
        let record = json!({"id": 1, "user_id": "5"});
        assert!(manager.authorize(Action::Read, &owner, Some(&record)));
    }
}

// Workflow execution - a declarative state machine over one status column,
// with role guards, before/after hooks, and an append-only transition
// history.

use crate::access::ActorContext;
use crate::db::quote_ident;
use crate::engine::{now_string, pk_column, Engine};
use crate::error::{MetatableError, Result};
use crate::metadata::{TransitionConfig, WorkflowConfig};
use crate::model::FieldModel;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

const HISTORY_TABLE: &str = "_workflow_history";

const HISTORY_DDL: &str = "
CREATE TABLE IF NOT EXISTS _workflow_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id INTEGER NOT NULL,
    transition TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT NOT NULL,
    actor_user_id INTEGER,
    actor_ip TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_history_record
    ON _workflow_history (table_name, record_id);
";

/// What a hook sees when a transition runs.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub table: String,
    pub record_id: i64,
    pub transition: String,
    pub from_state: String,
    pub to_state: String,
    pub actor: ActorContext,
}

/// A before hook may veto the transition by returning an error; the whole
/// operation rolls back, history entry included.
pub type Hook = Box<dyn Fn(&HookEvent) -> Result<()>>;

/// A transition the current actor may run from a given state, shaped for
/// rendering action buttons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTransition {
    pub name: String,
    pub to: String,
    pub label: Option<String>,
    pub color: Option<String>,
}

/// What a successful transition reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub from_state: String,
    pub to_state: String,
}

/// One row of the transition audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowHistoryEntry {
    pub id: i64,
    pub transition: String,
    /// None for entries recorded at initial creation rather than by a
    /// transition.
    pub from_state: Option<String>,
    pub to_state: String,
    pub actor_user_id: Option<i64>,
    pub actor_ip: Option<String>,
    pub created_at: String,
}

/// Executes the workflow one table declares in its metadata. Construction
/// validates the declaration, so a broken config fails at load time rather
/// than mid-transition.
pub struct WorkflowEngine<'e> {
    engine: &'e Engine,
    model: Rc<FieldModel>,
    config: WorkflowConfig,
    before_hooks: HashMap<String, Vec<Hook>>,
    after_hooks: HashMap<String, Vec<Hook>>,
}

impl Engine {
    /// Workflow handle for a table. Errors when the table declares no
    /// workflow or declares an inconsistent one.
    pub fn workflow(&self, table: &str) -> Result<WorkflowEngine<'_>> {
        WorkflowEngine::for_table(self, table)
    }
}

// Hook closures are opaque; render their registered names only.
impl fmt::Debug for WorkflowEngine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("table", &self.model.table)
            .field("config", &self.config)
            .field("before_hooks", &self.before_hooks.keys())
            .field("after_hooks", &self.after_hooks.keys())
            .finish()
    }
}

impl<'e> WorkflowEngine<'e> {
    pub fn for_table(engine: &'e Engine, table: &str) -> Result<Self> {
        let model = engine.resolve(table)?;
        let config = model
            .metadata
            .workflow
            .clone()
            .ok_or_else(|| {
                MetatableError::WorkflowConfig(format!("Table '{table}' declares no workflow"))
            })?;
        validate_config(&model, &config)?;
        Ok(WorkflowEngine {
            engine,
            model,
            config,
            before_hooks: HashMap::new(),
            after_hooks: HashMap::new(),
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Register a hook that runs inside the transaction, before the state
    /// is written. An error here vetoes the transition.
    pub fn on_before(&mut self, transition: &str, hook: Hook) {
        self.before_hooks
            .entry(transition.to_string())
            .or_default()
            .push(hook);
    }

    /// Register a hook that runs inside the transaction, after the state
    /// and history are written. An error still rolls everything back.
    pub fn on_after(&mut self, transition: &str, hook: Hook) {
        self.after_hooks
            .entry(transition.to_string())
            .or_default()
            .push(hook);
    }

    /// The record's current workflow state, read fresh.
    pub fn current_state(&self, record_id: i64) -> Result<String> {
        let record = self
            .engine
            .fetch_record(&self.model, record_id, true)?
            .ok_or(MetatableError::RecordNotFound {
                table: self.model.table.clone(),
                id: record_id,
            })?;
        Ok(state_of(&record, &self.config.field))
    }

    /// Transitions the actor may run from the given state, in
    /// transition-name order.
    pub fn available_transitions(&self, state: &str, actor: &ActorContext) -> Vec<AvailableTransition> {
        self.config
            .transitions
            .iter()
            .filter(|(_, cfg)| cfg.from.contains(state) && role_allowed(cfg, actor))
            .map(|(name, cfg)| AvailableTransition {
                name: name.clone(),
                to: cfg.to.clone(),
                label: cfg.label.clone(),
                color: cfg.color.clone(),
            })
            .collect()
    }

    /// Run a named transition against a record. The state is re-read inside
    /// the transaction, so a stale caller cannot skip a guard. State update,
    /// history entry, and hooks succeed or fail as one unit.
    pub fn transition(
        &self,
        record_id: i64,
        name: &str,
        actor: &ActorContext,
    ) -> Result<TransitionOutcome> {
        let cfg = self.config.transitions.get(name).ok_or_else(|| {
            MetatableError::TransitionNotAllowed(format!("Unknown transition '{name}'"))
        })?;
        if !role_allowed(cfg, actor) {
            return Err(MetatableError::PermissionDenied {
                action: format!("transition '{name}'"),
                table: self.model.table.clone(),
            });
        }

        // DDL commits implicitly in SQLite, so this stays outside the
        // operation's transaction
        self.ensure_history_table()?;

        let pk = pk_column(&self.model)?.to_string();
        self.engine.in_transaction(|| {
            let record = self
                .engine
                .fetch_record(&self.model, record_id, true)?
                .ok_or(MetatableError::RecordNotFound {
                    table: self.model.table.clone(),
                    id: record_id,
                })?;
            let current = state_of(&record, &self.config.field);
            if !cfg.from.contains(&current) {
                return Err(MetatableError::TransitionNotAllowed(format!(
                    "'{name}' cannot run from state '{current}'"
                )));
            }

            let event = HookEvent {
                table: self.model.table.clone(),
                record_id,
                transition: name.to_string(),
                from_state: current.clone(),
                to_state: cfg.to.clone(),
                actor: actor.clone(),
            };
            self.run_hooks(&self.before_hooks, name, &event)?;

            self.write_state(record_id, &pk, &cfg.to)?;
            self.append_history(&event)?;

            self.run_hooks(&self.after_hooks, name, &event)?;
            log::info!(
                "Transition '{name}' on {}/{record_id}: {current} -> {}",
                self.model.table,
                cfg.to
            );
            Ok(TransitionOutcome {
                from_state: event.from_state,
                to_state: event.to_state,
            })
        })
    }

    /// The record's transition history, most recent first.
    pub fn history(&self, record_id: i64) -> Result<Vec<WorkflowHistoryEntry>> {
        self.ensure_history_table()?;
        let rows = self.engine.db().query_rows(
            &format!(
                "SELECT * FROM {HISTORY_TABLE} WHERE table_name = ?1 AND record_id = ?2 \
                 ORDER BY id DESC"
            ),
            &[
                Value::String(self.model.table.clone()),
                Value::Number(record_id.into()),
            ],
        )?;
        Ok(rows.iter().map(history_entry).collect())
    }

    fn ensure_history_table(&self) -> Result<()> {
        self.engine.db().execute_batch(HISTORY_DDL)
    }

    fn write_state(&self, record_id: i64, pk: &str, to_state: &str) -> Result<()> {
        let mut assignments = format!("{} = ?1", quote_ident(&self.config.field));
        let mut params = vec![Value::String(to_state.to_string())];
        if let Some(ts) = &self.model.metadata.timestamps {
            if self.model.has_field(&ts.updated_at_column) {
                params.push(Value::String(now_string()));
                assignments.push_str(&format!(
                    ", {} = ?{}",
                    quote_ident(&ts.updated_at_column),
                    params.len()
                ));
            }
        }
        params.push(Value::Number(record_id.into()));
        self.engine.db().execute(
            &format!(
                "UPDATE {} SET {assignments} WHERE {} = ?{}",
                quote_ident(&self.model.table),
                quote_ident(pk),
                params.len()
            ),
            &params,
        )?;
        Ok(())
    }

    fn append_history(&self, event: &HookEvent) -> Result<()> {
        self.engine.db().execute(
            &format!(
                "INSERT INTO {HISTORY_TABLE} \
                 (table_name, record_id, transition, from_state, to_state, \
                  actor_user_id, actor_ip, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            &[
                Value::String(event.table.clone()),
                Value::Number(event.record_id.into()),
                Value::String(event.transition.clone()),
                Value::String(event.from_state.clone()),
                Value::String(event.to_state.clone()),
                event
                    .actor
                    .user_id
                    .map(|id| Value::Number(id.into()))
                    .unwrap_or(Value::Null),
                event
                    .actor
                    .ip
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
                Value::String(now_string()),
            ],
        )?;
        Ok(())
    }

    fn run_hooks(&self, hooks: &HashMap<String, Vec<Hook>>, name: &str, event: &HookEvent) -> Result<()> {
        if let Some(registered) = hooks.get(name) {
            for hook in registered {
                hook(event)?;
            }
        }
        Ok(())
    }
}

fn validate_config(model: &FieldModel, config: &WorkflowConfig) -> Result<()> {
    if config.field.is_empty() || !model.has_field(&config.field) {
        return Err(MetatableError::WorkflowConfig(format!(
            "Workflow field '{}' is not a column of '{}'",
            config.field, model.table
        )));
    }
    if config.states.is_empty() {
        return Err(MetatableError::WorkflowConfig(
            "Workflow declares no states".to_string(),
        ));
    }
    let unique: BTreeSet<&str> = config.states.iter().map(String::as_str).collect();
    if unique.len() != config.states.len() {
        return Err(MetatableError::WorkflowConfig(
            "Workflow states contain duplicates".to_string(),
        ));
    }
    for (name, cfg) in &config.transitions {
        if !unique.contains(cfg.to.as_str()) {
            return Err(MetatableError::WorkflowConfig(format!(
                "Transition '{name}' targets undeclared state '{}'",
                cfg.to
            )));
        }
        for from in cfg.from.iter() {
            if !unique.contains(from) {
                return Err(MetatableError::WorkflowConfig(format!(
                    "Transition '{name}' leaves undeclared state '{from}'"
                )));
            }
        }
    }
    Ok(())
}

fn role_allowed(cfg: &TransitionConfig, actor: &ActorContext) -> bool {
    match &cfg.permissions {
        Some(roles) => roles.iter().any(|r| r == "*" || r == &actor.role),
        None => true,
    }
}

/// Missing or null state columns read as the empty string; the from-state
/// guard then rejects any transition not declared for it.
fn state_of(record: &Value, field: &str) -> String {
    record
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn history_entry(row: &Value) -> WorkflowHistoryEntry {
    WorkflowHistoryEntry {
        id: row["id"].as_i64().unwrap_or_default(),
        transition: row["transition"].as_str().unwrap_or_default().to_string(),
        from_state: row["from_state"].as_str().map(str::to_string),
        to_state: row["to_state"].as_str().unwrap_or_default().to_string(),
        actor_user_id: row["actor_user_id"].as_i64(),
        actor_ip: row["actor_ip"].as_str().map(str::to_string),
        created_at: row["created_at"].as_str().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ORDERS_WORKFLOW: &str = r#"{
        "timestamps": {},
        "workflow": {
            "field": "status",
            "states": ["pending", "paid", "shipped", "cancelled"],
            "transitions": {
                "pay":    {"from": "pending", "to": "paid", "label": "Mark paid", "color": "green"},
                "ship":   {"from": "paid", "to": "shipped", "permissions": ["admin"]},
                "cancel": {"from": ["pending", "paid"], "to": "cancelled"}
            }
        }
    }"#;

    fn setup() -> Engine {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .db()
            .execute_batch(
                "CREATE TABLE orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    customer TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT,
                    updated_at TEXT
                );",
            )
            .unwrap();
        engine
            .catalog()
            .set_table_comment("orders", ORDERS_WORKFLOW)
            .unwrap();
        engine
    }

    fn admin() -> ActorContext {
        ActorContext::with_user("admin", 1).ip("10.0.0.1")
    }

    fn new_order(engine: &Engine) -> i64 {
        let input = json!({"customer": "Ada"}).as_object().unwrap().clone();
        engine.create("orders", &input, &admin()).unwrap()
    }

    #[test]
    fn test_missing_workflow_declaration() {
        let engine = setup();
        engine
            .db()
            .execute_batch("CREATE TABLE plain (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        assert!(matches!(
            engine.workflow("plain").unwrap_err(),
            MetatableError::WorkflowConfig(_)
        ));
    }

    #[test]
    fn test_inconsistent_config_fails_at_construction() {
        let engine = setup();
        engine
            .catalog()
            .set_table_comment(
                "orders",
                r#"{"workflow": {
                    "field": "status",
                    "states": ["pending"],
                    "transitions": {"launch": {"from": "pending", "to": "orbit"}}
                }}"#,
            )
            .unwrap();
        engine.invalidate_model("orders");

        let err = engine.workflow("orders").unwrap_err();
        match err {
            MetatableError::WorkflowConfig(msg) => assert!(msg.contains("orbit")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_transition_updates_state_and_history() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();

        assert_eq!(workflow.current_state(id).unwrap(), "pending");
        let outcome = workflow.transition(id, "pay", &admin()).unwrap();
        assert_eq!(outcome.from_state, "pending");
        assert_eq!(outcome.to_state, "paid");
        assert_eq!(workflow.current_state(id).unwrap(), "paid");

        let history = workflow.history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transition, "pay");
        assert_eq!(history[0].from_state.as_deref(), Some("pending"));
        assert_eq!(history[0].to_state, "paid");
        assert_eq!(history[0].actor_user_id, Some(1));
        assert_eq!(history[0].actor_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();

        workflow.transition(id, "pay", &admin()).unwrap();
        workflow.transition(id, "ship", &admin()).unwrap();

        let history = workflow.history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].transition, "ship");
        assert_eq!(history[1].transition, "pay");
    }

    #[test]
    fn test_history_accepts_null_from_state() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();
        workflow.transition(id, "pay", &admin()).unwrap();

        // A creation-style entry carries no originating state
        engine
            .db()
            .execute(
                "INSERT INTO _workflow_history \
                 (table_name, record_id, transition, from_state, to_state, created_at) \
                 VALUES ('orders', ?1, 'created', NULL, 'pending', '2026-01-01 00:00:00')",
                &[json!(id)],
            )
            .unwrap();

        let history = workflow.history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].from_state.is_none());
        assert_eq!(history[1].from_state.as_deref(), Some("pending"));
    }

    #[test]
    fn test_debug_output_elides_hook_closures() {
        let engine = setup();
        let mut workflow = engine.workflow("orders").unwrap();
        workflow.on_before("pay", Box::new(|_| Ok(())));

        let rendered = format!("{workflow:?}");
        assert!(rendered.contains("WorkflowEngine"));
        assert!(rendered.contains("orders"));
        assert!(rendered.contains("pay"));
    }

    #[test]
    fn test_from_state_guard() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();

        // ship is only valid from paid
        let err = workflow.transition(id, "ship", &admin()).unwrap_err();
        match err {
            MetatableError::TransitionNotAllowed(msg) => {
                assert!(msg.contains("pending"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(workflow.current_state(id).unwrap(), "pending");
        assert!(workflow.history(id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_transition() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();
        assert!(matches!(
            workflow.transition(id, "teleport", &admin()).unwrap_err(),
            MetatableError::TransitionNotAllowed(_)
        ));
    }

    #[test]
    fn test_role_guard_on_transition() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();

        workflow.transition(id, "pay", &admin()).unwrap();
        let clerk = ActorContext::with_user("clerk", 2);
        assert!(matches!(
            workflow.transition(id, "ship", &clerk).unwrap_err(),
            MetatableError::PermissionDenied { .. }
        ));
        // The unrestricted cancel still works for the clerk
        workflow.transition(id, "cancel", &clerk).unwrap();
        assert_eq!(workflow.current_state(id).unwrap(), "cancelled");
    }

    #[test]
    fn test_available_transitions_respect_state_and_role() {
        let engine = setup();
        let workflow = engine.workflow("orders").unwrap();

        let clerk = ActorContext::with_user("clerk", 2);
        let from_pending: Vec<String> = workflow
            .available_transitions("pending", &clerk)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(from_pending, vec!["cancel", "pay"]);

        // ship is admin-only
        let from_paid: Vec<String> = workflow
            .available_transitions("paid", &clerk)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(from_paid, vec!["cancel"]);

        let pay = workflow
            .available_transitions("pending", &admin())
            .into_iter()
            .find(|t| t.name == "pay")
            .unwrap();
        assert_eq!(pay.label.as_deref(), Some("Mark paid"));
        assert_eq!(pay.color.as_deref(), Some("green"));
        assert_eq!(pay.to, "paid");
    }

    #[test]
    fn test_before_hook_veto_rolls_back() {
        let engine = setup();
        let id = new_order(&engine);
        let mut workflow = engine.workflow("orders").unwrap();

        workflow.on_before(
            "pay",
            Box::new(|_| Err(MetatableError::Other("payment gateway unreachable".into()))),
        );

        assert!(workflow.transition(id, "pay", &admin()).is_err());
        assert_eq!(workflow.current_state(id).unwrap(), "pending");
        assert!(workflow.history(id).unwrap().is_empty());
    }

    #[test]
    fn test_hooks_observe_event_and_run_in_order() {
        let engine = setup();
        let id = new_order(&engine);
        let mut workflow = engine.workflow("orders").unwrap();

        let calls = Rc::new(RefCell::new(Vec::new()));
        let before_calls = Rc::clone(&calls);
        workflow.on_before(
            "pay",
            Box::new(move |event| {
                before_calls
                    .borrow_mut()
                    .push(format!("before {} -> {}", event.from_state, event.to_state));
                Ok(())
            }),
        );
        let after_calls = Rc::clone(&calls);
        workflow.on_after(
            "pay",
            Box::new(move |event| {
                after_calls
                    .borrow_mut()
                    .push(format!("after {}/{}", event.table, event.record_id));
                Ok(())
            }),
        );

        workflow.transition(id, "pay", &admin()).unwrap();
        assert_eq!(
            *calls.borrow(),
            vec!["before pending -> paid".to_string(), format!("after orders/{id}")]
        );
    }

    #[test]
    fn test_stale_state_cannot_skip_guard() {
        let engine = setup();
        let id = new_order(&engine);
        let workflow = engine.workflow("orders").unwrap();

        workflow.transition(id, "pay", &admin()).unwrap();
        workflow.transition(id, "cancel", &admin()).unwrap();
        // A caller still holding "paid" cannot ship a cancelled order
        assert!(matches!(
            workflow.transition(id, "ship", &admin()).unwrap_err(),
            MetatableError::TransitionNotAllowed(_)
        ));
    }

    #[test]
    fn test_transition_stamps_updated_at() {
        let engine = setup();
        let id = new_order(&engine);
        engine
            .db()
            .execute("UPDATE orders SET updated_at = NULL WHERE id = ?1", &[json!(id)])
            .unwrap();

        let workflow = engine.workflow("orders").unwrap();
        workflow.transition(id, "pay", &admin()).unwrap();
        let row = engine
            .db()
            .query_row("SELECT updated_at FROM orders WHERE id = ?1", &[json!(id)])
            .unwrap()
            .unwrap();
        assert!(row["updated_at"].is_string());
    }
}

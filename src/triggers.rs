//! # Row-change capture triggers
//!
//! Generates and installs the PL/pgSQL trigger functions that capture row
//! changes at the database layer. The trigger fires regardless of which code
//! path touched the row, assembles the row-change payload server-side
//! (old/new snapshots via `to_jsonb`, request context from the
//! `pgbus.context` setting, optional extras from a configured builder
//! function), and for durable channels inserts into the outbox before
//! NOTIFYing with the stored row's id.
//!
//! Installation is idempotent: functions use `CREATE OR REPLACE` and
//! triggers are dropped before being recreated, so re-running setup against
//! an already-provisioned database is safe.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::channel::{Channel, Entity, RowChange, RowChangeSpec, SchemaVersions};
use crate::error::Result;

/// When the trigger fires relative to the row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerWhen {
    /// Fires before the change is applied; capture-time state, the change
    /// may still be aborted
    Before,
    /// Fires after the change is applied
    After,
}

impl TriggerWhen {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Before => "bt",
            Self::After => "af",
        }
    }
}

/// Which statement kinds the trigger fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerOp {
    Insert,
    Update,
    Delete,
}

impl TriggerOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
        }
    }
}

/// Everything needed to generate one capture trigger
#[derive(Debug, Clone)]
pub struct TriggerDefinition {
    /// Table the trigger is installed on
    pub table: String,
    /// Application tag stamped into payloads
    pub app: String,
    /// Entity type tag stamped into payloads
    pub model: String,
    /// Wire name the trigger NOTIFYs on
    pub wire_name: String,
    /// Firing phase
    pub when: TriggerWhen,
    /// Statement kinds the trigger fires on
    pub ops: Vec<TriggerOp>,
    /// Whether the trigger writes through the outbox
    pub durable: bool,
    /// Schema version stamped into payloads at install time
    pub db_version: Option<i64>,
}

impl fmt::Display for TriggerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ON {}", self.trigger_name(), self.table)
    }
}

impl TriggerDefinition {
    /// Build a definition for a row-change channel
    pub fn for_channel<S: RowChangeSpec>(when: TriggerWhen, ops: Vec<TriggerOp>) -> Self {
        Self {
            table: S::Entity::TABLE.to_string(),
            app: S::Entity::APP.to_string(),
            model: S::Entity::MODEL.to_string(),
            wire_name: RowChange::<S>::wire_name(),
            when,
            ops,
            durable: S::DURABLE,
            db_version: None,
        }
    }

    /// Stamp the schema version taken from a version oracle
    pub fn with_db_version(mut self, db_version: Option<i64>) -> Self {
        self.db_version = db_version;
        self
    }

    /// PL/pgSQL function name; wire names leave enough headroom under the
    /// 63-character identifier limit for the phase/op tags.
    pub fn function_name(&self) -> String {
        format!("{}_{}{}", self.wire_name, self.when.tag(), self.ops_tag())
    }

    /// Trigger name on the target table
    pub fn trigger_name(&self) -> String {
        format!("{}_tg", self.function_name())
    }

    fn ops_tag(&self) -> String {
        self.ops.iter().map(|op| op.tag()).collect()
    }

    fn ops_sql(&self) -> String {
        self.ops
            .iter()
            .map(|op| op.as_sql())
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn db_version_sql(&self) -> String {
        match self.db_version {
            Some(version) => version.to_string(),
            None => "NULL".to_string(),
        }
    }

    /// `CREATE OR REPLACE FUNCTION` statement for the capture function
    pub fn create_function_sql(&self) -> String {
        let delivery = if self.durable {
            format!(
                "    INSERT INTO pgbus_notification (channel, payload, db_version)\n        VALUES ('{}', payload, {})\n        RETURNING id::text INTO notify_payload;",
                self.wire_name,
                self.db_version_sql(),
            )
        } else {
            "    notify_payload := payload::text;".to_string()
        };

        format!(
            r#"CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $pgbus$
DECLARE
    payload JSONB;
    notify_payload TEXT;
    context JSONB;
    extras_builder TEXT;
    extras JSONB;
BEGIN
    context := COALESCE(NULLIF(current_setting('pgbus.context', true), ''), '{{}}')::jsonb;
    payload := jsonb_build_object(
        'app', '{app}',
        'model', '{model}',
        'old', COALESCE(to_jsonb(OLD), 'null'::jsonb),
        'new', COALESCE(to_jsonb(NEW), 'null'::jsonb),
        'context', context,
        'db_version', {version}
    );
    extras_builder := NULLIF(current_setting('pgbus.payload_extras_builder', true), '');
    IF extras_builder IS NOT NULL THEN
        EXECUTE format('SELECT %I()', extras_builder) INTO extras;
        payload := jsonb_insert(payload, '{{extras}}', COALESCE(extras, '{{}}'::jsonb));
    END IF;
{delivery}
    PERFORM pg_notify('{wire}', notify_payload);
    RETURN COALESCE(NEW, OLD);
END;
$pgbus$ LANGUAGE plpgsql;"#,
            function = self.function_name(),
            app = self.app,
            model = self.model,
            version = self.db_version_sql(),
            delivery = delivery,
            wire = self.wire_name,
        )
    }

    /// `DROP TRIGGER IF EXISTS` statement
    pub fn drop_trigger_sql(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            self.trigger_name(),
            self.table
        )
    }

    /// `CREATE TRIGGER` statement binding the function to the table
    pub fn create_trigger_sql(&self) -> String {
        format!(
            "CREATE TRIGGER {trigger} {when} {ops} ON {table} \
             FOR EACH ROW EXECUTE FUNCTION {function}()",
            trigger = self.trigger_name(),
            when = self.when.as_sql(),
            ops = self.ops_sql(),
            table = self.table,
            function = self.function_name(),
        )
    }

    /// `DROP FUNCTION IF EXISTS` statement
    pub fn drop_function_sql(&self) -> String {
        format!("DROP FUNCTION IF EXISTS {}()", self.function_name())
    }
}

/// Definition firing before inserts
pub fn pre_insert<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::Before, vec![TriggerOp::Insert])
}

/// Definition firing after inserts
pub fn post_insert<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::After, vec![TriggerOp::Insert])
}

/// Definition firing before updates
pub fn pre_update<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::Before, vec![TriggerOp::Update])
}

/// Definition firing after updates
pub fn post_update<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::After, vec![TriggerOp::Update])
}

/// Definition firing before deletes
pub fn pre_delete<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::Before, vec![TriggerOp::Delete])
}

/// Definition firing after deletes
pub fn post_delete<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(TriggerWhen::After, vec![TriggerOp::Delete])
}

/// Definition firing before inserts and updates
pub fn pre_save<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(
        TriggerWhen::Before,
        vec![TriggerOp::Insert, TriggerOp::Update],
    )
}

/// Definition firing after inserts and updates
pub fn post_save<S: RowChangeSpec>() -> TriggerDefinition {
    TriggerDefinition::for_channel::<S>(
        TriggerWhen::After,
        vec![TriggerOp::Insert, TriggerOp::Update],
    )
}

/// Installs capture triggers, skipping definitions already installed
/// through this installer instance.
pub struct TriggerInstaller {
    pool: PgPool,
    installed: Mutex<HashSet<String>>,
}

impl fmt::Debug for TriggerInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerInstaller")
            .field("installed", &self.installed.lock().len())
            .finish()
    }
}

impl TriggerInstaller {
    /// Create an installer over a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            installed: Mutex::new(HashSet::new()),
        }
    }

    /// Install a trigger definition. Returns `false` when this installer
    /// already installed it.
    #[instrument(skip_all, fields(table = %definition.table, trigger = %definition.trigger_name()))]
    pub async fn install(&self, definition: &TriggerDefinition) -> Result<bool> {
        let key = format!("{}:{}", definition.table, definition.trigger_name());
        if self.installed.lock().contains(&key) {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&definition.create_function_sql())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&definition.drop_trigger_sql())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&definition.create_trigger_sql())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!("installed capture trigger");
        self.installed.lock().insert(key);
        Ok(true)
    }

    /// Install a trigger for a row-change channel, stamping the current
    /// schema version from the oracle.
    pub async fn install_for<S: RowChangeSpec>(
        &self,
        when: TriggerWhen,
        ops: Vec<TriggerOp>,
        versions: &dyn SchemaVersions,
    ) -> Result<bool> {
        let definition = TriggerDefinition::for_channel::<S>(when, ops)
            .with_db_version(versions.current_version(S::Entity::APP));
        self.install(&definition).await
    }

    /// Drop a trigger and its capture function
    #[instrument(skip_all, fields(table = %definition.table, trigger = %definition.trigger_name()))]
    pub async fn uninstall(&self, definition: &TriggerDefinition) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&definition.drop_trigger_sql())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&definition.drop_function_sql())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let key = format!("{}:{}", definition.table, definition.trigger_name());
        self.installed.lock().remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MAX_POSTGRES_CHANNEL_LENGTH;

    fn definition(durable: bool) -> TriggerDefinition {
        TriggerDefinition {
            table: "tests_author".to_string(),
            app: "tests".to_string(),
            model: "Author".to_string(),
            wire_name: crate::wire::wire_name("tests_author_changes"),
            when: TriggerWhen::After,
            ops: vec![TriggerOp::Insert, TriggerOp::Update],
            durable,
            db_version: None,
        }
    }

    #[test]
    fn test_identifier_lengths_fit_postgres_limit() {
        let def = definition(true);
        assert!(def.function_name().len() <= MAX_POSTGRES_CHANNEL_LENGTH);
        assert!(def.trigger_name().len() <= MAX_POSTGRES_CHANNEL_LENGTH);
    }

    #[test]
    fn test_distinct_phases_and_ops_get_distinct_names() {
        let mut after = definition(true);
        let mut before = after.clone();
        before.when = TriggerWhen::Before;
        assert_ne!(after.function_name(), before.function_name());

        after.ops = vec![TriggerOp::Delete];
        assert_ne!(after.function_name(), definition(true).function_name());
    }

    #[test]
    fn test_durable_function_writes_through_outbox() {
        let sql = definition(true).create_function_sql();
        assert!(sql.contains("INSERT INTO pgbus_notification"));
        assert!(sql.contains("RETURNING id::text INTO notify_payload"));
        assert!(sql.contains("PERFORM pg_notify"));
    }

    #[test]
    fn test_non_durable_function_notifies_full_payload() {
        let sql = definition(false).create_function_sql();
        assert!(!sql.contains("INSERT INTO pgbus_notification"));
        assert!(sql.contains("notify_payload := payload::text"));
    }

    #[test]
    fn test_function_reads_context_and_extras_settings() {
        let sql = definition(true).create_function_sql();
        assert!(sql.contains("current_setting('pgbus.context', true)"));
        assert!(sql.contains("current_setting('pgbus.payload_extras_builder', true)"));
        assert!(sql.contains("EXECUTE format('SELECT %I()', extras_builder)"));
    }

    #[test]
    fn test_db_version_is_stamped_or_null() {
        let sql = definition(true).create_function_sql();
        assert!(sql.contains("'db_version', NULL"));

        let sql = definition(true).with_db_version(Some(42)).create_function_sql();
        assert!(sql.contains("'db_version', 42"));
        assert!(sql.contains("VALUES ('pgbus_"));
    }

    #[test]
    fn test_trigger_sql_covers_requested_ops() {
        let def = definition(true);
        let sql = def.create_trigger_sql();
        assert!(sql.contains("AFTER INSERT OR UPDATE ON tests_author"));
        assert!(sql.contains("FOR EACH ROW EXECUTE FUNCTION"));
        assert!(def.drop_trigger_sql().starts_with("DROP TRIGGER IF EXISTS"));
    }

    #[test]
    fn test_save_helpers_cover_insert_and_update() {
        struct Spec;
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct Row {
            id: i64,
        }
        #[async_trait::async_trait]
        impl Entity for Row {
            const APP: &'static str = "tests";
            const MODEL: &'static str = "Row";
            const TABLE: &'static str = "tests_row";
            fn field_names() -> &'static [&'static str] {
                &["id"]
            }
        }
        impl RowChangeSpec for Spec {
            type Entity = Row;
        }

        let def = post_save::<Spec>();
        assert_eq!(def.ops, vec![TriggerOp::Insert, TriggerOp::Update]);
        assert_eq!(def.when, TriggerWhen::After);
        assert!(def.durable);
        assert_eq!(def.table, "tests_row");
    }
}

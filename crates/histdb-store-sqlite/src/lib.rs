use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use histdb_core::{
    order_conditions, AxisDefinition, ConditionDefinition, DefinitionError, DefinitionSnapshot,
    GateApplication, ParameterDefinition, Point, RawCondition, SpectrumDefinition, TreeVariable,
};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS save_sets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS parameter_defs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  save_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  number INTEGER NOT NULL,
  low REAL,
  high REAL,
  bins INTEGER,
  units TEXT,
  FOREIGN KEY (save_id) REFERENCES save_sets(id)
);

CREATE TABLE IF NOT EXISTS spectrum_defs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  save_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  datatype TEXT NOT NULL,
  FOREIGN KEY (save_id) REFERENCES save_sets(id)
);

CREATE TABLE IF NOT EXISTS axis_defs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  spectrum_id INTEGER NOT NULL,
  low REAL NOT NULL,
  high REAL NOT NULL,
  bins INTEGER NOT NULL,
  FOREIGN KEY (spectrum_id) REFERENCES spectrum_defs(id)
);

CREATE TABLE IF NOT EXISTS spectrum_params (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  spectrum_id INTEGER NOT NULL,
  parameter_id INTEGER NOT NULL,
  FOREIGN KEY (spectrum_id) REFERENCES spectrum_defs(id),
  FOREIGN KEY (parameter_id) REFERENCES parameter_defs(id)
);

CREATE TABLE IF NOT EXISTS spectrum_x_params (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  spectrum_id INTEGER NOT NULL,
  parameter_id INTEGER NOT NULL,
  FOREIGN KEY (spectrum_id) REFERENCES spectrum_defs(id),
  FOREIGN KEY (parameter_id) REFERENCES parameter_defs(id)
);

CREATE TABLE IF NOT EXISTS spectrum_y_params (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  spectrum_id INTEGER NOT NULL,
  parameter_id INTEGER NOT NULL,
  FOREIGN KEY (spectrum_id) REFERENCES spectrum_defs(id),
  FOREIGN KEY (parameter_id) REFERENCES parameter_defs(id)
);

CREATE TABLE IF NOT EXISTS gate_defs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  saveset_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  FOREIGN KEY (saveset_id) REFERENCES save_sets(id)
);

CREATE TABLE IF NOT EXISTS gate_points (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  gate_id INTEGER NOT NULL,
  x REAL NOT NULL,
  y REAL NOT NULL,
  FOREIGN KEY (gate_id) REFERENCES gate_defs(id)
);

CREATE TABLE IF NOT EXISTS gate_parameters (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_gate INTEGER NOT NULL,
  parameter_id INTEGER NOT NULL,
  FOREIGN KEY (parent_gate) REFERENCES gate_defs(id),
  FOREIGN KEY (parameter_id) REFERENCES parameter_defs(id)
);

CREATE TABLE IF NOT EXISTS component_gates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_gate INTEGER NOT NULL,
  child_gate INTEGER NOT NULL,
  FOREIGN KEY (parent_gate) REFERENCES gate_defs(id),
  FOREIGN KEY (child_gate) REFERENCES gate_defs(id)
);

CREATE TABLE IF NOT EXISTS gate_masks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_gate INTEGER NOT NULL,
  mask INTEGER NOT NULL,
  FOREIGN KEY (parent_gate) REFERENCES gate_defs(id)
);

CREATE TABLE IF NOT EXISTS gate_applications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  spectrum_id INTEGER NOT NULL,
  gate_id INTEGER NOT NULL,
  FOREIGN KEY (spectrum_id) REFERENCES spectrum_defs(id),
  FOREIGN KEY (gate_id) REFERENCES gate_defs(id)
);

CREATE TABLE IF NOT EXISTS treevariables (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  save_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  value REAL NOT NULL,
  units TEXT,
  FOREIGN KEY (save_id) REFERENCES save_sets(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_parameter_defs_name ON parameter_defs(save_id, name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_spectrum_defs_name ON spectrum_defs(save_id, name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_gate_defs_name ON gate_defs(saveset_id, name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_treevariables_name ON treevariables(save_id, name);
CREATE INDEX IF NOT EXISTS idx_axis_defs_spectrum ON axis_defs(spectrum_id);
CREATE INDEX IF NOT EXISTS idx_spectrum_params_spectrum ON spectrum_params(spectrum_id);
CREATE INDEX IF NOT EXISTS idx_spectrum_x_params_spectrum ON spectrum_x_params(spectrum_id);
CREATE INDEX IF NOT EXISTS idx_spectrum_y_params_spectrum ON spectrum_y_params(spectrum_id);
CREATE INDEX IF NOT EXISTS idx_gate_points_gate ON gate_points(gate_id);
CREATE INDEX IF NOT EXISTS idx_gate_parameters_parent ON gate_parameters(parent_gate);
CREATE INDEX IF NOT EXISTS idx_component_gates_parent ON component_gates(parent_gate);
CREATE INDEX IF NOT EXISTS idx_gate_masks_parent ON gate_masks(parent_gate);
CREATE INDEX IF NOT EXISTS idx_gate_applications_spectrum ON gate_applications(spectrum_id);
";

/// Tables cleared when a save-set is deleted, dependents before their parents.
const DELETE_SAVE_SET_STATEMENTS: [(&str, &str); 13] = [
    (
        "gate_applications",
        "DELETE FROM gate_applications
         WHERE spectrum_id IN (SELECT id FROM spectrum_defs WHERE save_id = ?1)
            OR gate_id IN (SELECT id FROM gate_defs WHERE saveset_id = ?1)",
    ),
    (
        "component_gates",
        "DELETE FROM component_gates
         WHERE parent_gate IN (SELECT id FROM gate_defs WHERE saveset_id = ?1)",
    ),
    (
        "gate_masks",
        "DELETE FROM gate_masks WHERE parent_gate IN (SELECT id FROM gate_defs WHERE saveset_id = ?1)",
    ),
    (
        "gate_parameters",
        "DELETE FROM gate_parameters
         WHERE parent_gate IN (SELECT id FROM gate_defs WHERE saveset_id = ?1)",
    ),
    (
        "gate_points",
        "DELETE FROM gate_points WHERE gate_id IN (SELECT id FROM gate_defs WHERE saveset_id = ?1)",
    ),
    ("gate_defs", "DELETE FROM gate_defs WHERE saveset_id = ?1"),
    (
        "spectrum_params",
        "DELETE FROM spectrum_params
         WHERE spectrum_id IN (SELECT id FROM spectrum_defs WHERE save_id = ?1)",
    ),
    (
        "spectrum_x_params",
        "DELETE FROM spectrum_x_params
         WHERE spectrum_id IN (SELECT id FROM spectrum_defs WHERE save_id = ?1)",
    ),
    (
        "spectrum_y_params",
        "DELETE FROM spectrum_y_params
         WHERE spectrum_id IN (SELECT id FROM spectrum_defs WHERE save_id = ?1)",
    ),
    (
        "axis_defs",
        "DELETE FROM axis_defs WHERE spectrum_id IN (SELECT id FROM spectrum_defs WHERE save_id = ?1)",
    ),
    ("spectrum_defs", "DELETE FROM spectrum_defs WHERE save_id = ?1"),
    ("parameter_defs", "DELETE FROM parameter_defs WHERE save_id = ?1"),
    ("treevariables", "DELETE FROM treevariables WHERE save_id = ?1"),
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open sqlite database at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create definition schema: {0}")]
    SchemaCreation(#[source] rusqlite::Error),
    #[error("no such save set: {0}")]
    SaveSetNotFound(String),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("stored condition `{name}` is malformed: {source}")]
    MalformedCondition {
        name: String,
        #[source]
        source: DefinitionError,
    },
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

trait PersistenceContext<T> {
    fn context(self, context: &str) -> Result<T, StoreError>;

    fn with_context<F>(self, context: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> String;
}

impl<T> PersistenceContext<T> for rusqlite::Result<T> {
    fn context(self, context: &str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Persistence { context: context.to_string(), source })
    }

    fn with_context<F>(self, context: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| StoreError::Persistence { context: context(), source })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveSet {
    pub id: i64,
    pub name: String,
    /// Creation time in seconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub parameters: usize,
    pub spectra: usize,
    pub conditions: usize,
    pub applications: usize,
    pub variables: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

/// A definition database file. Owns the connection; writers and readers
/// borrow it for the save-set they work on.
pub struct DefinitionStore {
    conn: Connection,
}

impl DefinitionStore {
    /// Open (creating if needed) a definition database and make sure every
    /// table exists.
    ///
    /// # Errors
    /// Returns [`StoreError::Open`] when the file cannot be opened and
    /// [`StoreError::SchemaCreation`] when the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let store = Self { conn };
        store.ensure_schema()?;
        debug!(path = %path.display(), "opened definition store");
        Ok(store)
    }

    /// Create any missing table or index. Safe to call on every open.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaCreation`] when a statement fails.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA_SQL).map_err(StoreError::SchemaCreation)
    }

    /// # Errors
    /// Returns an error when `sqlite_master` cannot be read.
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .context("failed to prepare table listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).context("failed to list tables")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read table name")
    }

    /// # Errors
    /// Returns an error when save-set rows cannot be read.
    pub fn list_save_sets(&self) -> Result<Vec<SaveSet>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, timestamp FROM save_sets ORDER BY id ASC")
            .context("failed to prepare save set listing")?;
        let rows = stmt.query_map([], save_set_from_row).context("failed to list save sets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read save set row")
    }

    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_save_set(&self, name: &str) -> Result<Option<SaveSet>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, timestamp FROM save_sets WHERE name = ?1",
                params![name],
                save_set_from_row,
            )
            .optional()
            .with_context(|| format!("failed to look up save set `{name}`"))
    }

    /// # Errors
    /// Returns an error when a save-set of that name already exists or the
    /// insert fails.
    pub fn create_save_set(&self, name: &str) -> Result<SaveSet, StoreError> {
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        self.conn
            .execute(
                "INSERT INTO save_sets (name, timestamp) VALUES (?1, ?2)",
                params![name, timestamp],
            )
            .with_context(|| format!("failed to create save set `{name}`"))?;

        let save_set = SaveSet { id: self.conn.last_insert_rowid(), name: name.to_string(), timestamp };
        info!(save_set = %save_set.name, id = save_set.id, "created save set");
        Ok(save_set)
    }

    /// # Errors
    /// Returns an error when the lookup or the insert fails.
    pub fn open_or_create_save_set(&self, name: &str) -> Result<SaveSet, StoreError> {
        match self.find_save_set(name)? {
            Some(save_set) => Ok(save_set),
            None => self.create_save_set(name),
        }
    }

    /// Delete a save-set and every definition it owns in one savepoint.
    /// Returns `false` when no save-set has that name.
    ///
    /// # Errors
    /// Returns an error when any delete fails; nothing is removed in that case.
    pub fn delete_save_set(&mut self, name: &str) -> Result<bool, StoreError> {
        let Some(save_set) = self.find_save_set(name)? else {
            return Ok(false);
        };

        in_savepoint(&mut self.conn, "delete_save_set", |conn| {
            for (table, sql) in DELETE_SAVE_SET_STATEMENTS {
                let removed = conn.execute(sql, params![save_set.id]).with_context(|| {
                    format!("failed to delete {table} rows of save set `{name}`")
                })?;
                debug!(save_set = name, table, removed, "deleted save set rows");
            }
            conn.execute("DELETE FROM save_sets WHERE id = ?1", params![save_set.id])
                .with_context(|| format!("failed to delete save set `{name}`"))?;
            Ok(())
        })?;

        info!(save_set = name, "deleted save set");
        Ok(true)
    }

    /// Delete `save_set` if it exists and write `snapshot` into a fresh
    /// save-set of the same name. The delete is undone when the write fails.
    ///
    /// # Errors
    /// Returns the first delete or batch error; the store is left unchanged.
    pub fn replace_save_set(
        &mut self,
        save_set: &str,
        snapshot: &DefinitionSnapshot,
    ) -> Result<SnapshotSummary, StoreError> {
        self.in_outer_savepoint("replace_save_set", |store| {
            let replaced = store.delete_save_set(save_set)?;
            debug!(save_set, replaced, "replacing save set");
            store.writer(save_set)?.save_snapshot(snapshot)
        })
    }

    /// Writer for `save_set`, creating the save-set on first use.
    ///
    /// # Errors
    /// Returns an error when the save-set cannot be looked up or created.
    pub fn writer(&mut self, save_set: &str) -> Result<SaveSetWriter<'_>, StoreError> {
        let save_set = self.open_or_create_save_set(save_set)?;
        Ok(SaveSetWriter { store: self, save_set })
    }

    /// Reader for an existing save-set.
    ///
    /// # Errors
    /// Returns [`StoreError::SaveSetNotFound`] when no save-set has that name.
    pub fn reader(&self, save_set: &str) -> Result<SaveSetReader<'_>, StoreError> {
        let save_set = self.require_save_set(save_set)?;
        Ok(SaveSetReader { store: self, save_set })
    }

    /// Run quick-check and foreign-key-check health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .context("failed to run PRAGMA foreign_key_check")?;
        let foreign_key_violations = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read foreign key violation")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
        })
    }

    /// Run `work` inside a savepoint that spans several batch savepoints.
    fn in_outer_savepoint<T, F>(&mut self, name: &str, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .with_context(|| format!("failed to open savepoint {name}"))?;

        match work(self) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {name}"))
                    .with_context(|| format!("failed to release savepoint {name}"))?;
                Ok(value)
            }
            Err(err) => {
                warn!(savepoint = name, error = %err, "rolling back");
                if let Err(rollback_err) =
                    self.conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    warn!(savepoint = name, error = %rollback_err, "rollback to savepoint failed");
                }
                Err(err)
            }
        }
    }

    fn require_save_set(&self, name: &str) -> Result<SaveSet, StoreError> {
        self.find_save_set(name)?.ok_or_else(|| StoreError::SaveSetNotFound(name.to_string()))
    }
}

/// Persists definitions into the active save-set. Every batch is written
/// inside a savepoint and rolled back as a whole when any row fails.
pub struct SaveSetWriter<'s> {
    store: &'s mut DefinitionStore,
    save_set: SaveSet,
}

impl SaveSetWriter<'_> {
    #[must_use]
    pub fn save_set(&self) -> &SaveSet {
        &self.save_set
    }

    /// Switch to another save-set, creating it if it does not exist.
    ///
    /// # Errors
    /// Returns an error when the save-set cannot be looked up or created.
    pub fn set_save_set(&mut self, name: &str) -> Result<(), StoreError> {
        self.save_set = self.store.open_or_create_save_set(name)?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when any insert fails; the batch is rolled back.
    pub fn save_parameter_definitions(
        &mut self,
        definitions: &[ParameterDefinition],
    ) -> Result<usize, StoreError> {
        let save_id = self.save_set.id;
        let written = in_savepoint(&mut self.store.conn, "save_parameters", |conn| {
            for definition in definitions {
                insert_parameter(conn, save_id, definition)?;
            }
            Ok(definitions.len())
        })?;

        info!(save_set = %self.save_set.name, parameters = written, "saved parameter definitions");
        Ok(written)
    }

    /// Write spectra with their axes and parameter links. Parameters are
    /// matched by name within the save-set; unknown names produce no link.
    ///
    /// # Errors
    /// Returns an error when any insert fails; the batch is rolled back.
    pub fn save_spectrum_definitions(
        &mut self,
        definitions: &[SpectrumDefinition],
    ) -> Result<usize, StoreError> {
        let save_id = self.save_set.id;
        let written = in_savepoint(&mut self.store.conn, "save_spectra", |conn| {
            for definition in definitions {
                insert_spectrum(conn, save_id, definition)?;
            }
            Ok(definitions.len())
        })?;

        info!(save_set = %self.save_set.name, spectra = written, "saved spectrum definitions");
        Ok(written)
    }

    /// Write conditions in dependency order so that every component already
    /// has a row when a compound condition links to it.
    ///
    /// # Errors
    /// Returns [`StoreError::Definition`] when the conditions cannot be ordered
    /// (nothing is written) or a dependency does not resolve to exactly one
    /// stored condition, and a persistence error when any insert fails. The
    /// batch is rolled back in both latter cases.
    pub fn save_condition_definitions(
        &mut self,
        definitions: &[ConditionDefinition],
    ) -> Result<usize, StoreError> {
        let ordered = order_conditions(definitions)?;
        let save_id = self.save_set.id;
        let written = in_savepoint(&mut self.store.conn, "save_conditions", |conn| {
            for definition in &ordered {
                insert_condition(conn, save_id, definition)?;
            }
            Ok(ordered.len())
        })?;

        info!(save_set = %self.save_set.name, conditions = written, "saved condition definitions");
        Ok(written)
    }

    /// Record which condition gates which spectrum. Ungated entries are
    /// skipped. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error when any insert fails; the batch is rolled back.
    pub fn save_gate_applications(
        &mut self,
        applications: &[GateApplication],
    ) -> Result<usize, StoreError> {
        if applications.is_empty() {
            return Ok(0);
        }

        let save_id = self.save_set.id;
        let written = in_savepoint(&mut self.store.conn, "save_applications", |conn| {
            let mut written = 0;
            for application in applications {
                written += insert_application(conn, save_id, application)?;
            }
            Ok(written)
        })?;

        info!(save_set = %self.save_set.name, applications = written, "saved gate applications");
        Ok(written)
    }

    /// # Errors
    /// Returns an error when any insert fails; the batch is rolled back.
    pub fn save_variables(&mut self, variables: &[TreeVariable]) -> Result<usize, StoreError> {
        let save_id = self.save_set.id;
        let written = in_savepoint(&mut self.store.conn, "save_variables", |conn| {
            for variable in variables {
                conn.execute(
                    "INSERT INTO treevariables (save_id, name, value, units) VALUES (?1, ?2, ?3, ?4)",
                    params![save_id, variable.name, variable.value, variable.units],
                )
                .with_context(|| format!("failed to insert tree variable `{}`", variable.name))?;
            }
            Ok(variables.len())
        })?;

        info!(save_set = %self.save_set.name, variables = written, "saved tree variables");
        Ok(written)
    }

    /// Write a whole snapshot: parameters, spectra, conditions, applications
    /// and variables, in that order. Either everything is written or nothing.
    ///
    /// # Errors
    /// Returns the first batch error; all earlier batches are rolled back too.
    pub fn save_snapshot(
        &mut self,
        snapshot: &DefinitionSnapshot,
    ) -> Result<SnapshotSummary, StoreError> {
        let save_set = self.save_set.clone();
        self.store.in_outer_savepoint("save_snapshot", |store| {
            SaveSetWriter { store, save_set }.save_snapshot_batches(snapshot)
        })
    }

    fn save_snapshot_batches(
        &mut self,
        snapshot: &DefinitionSnapshot,
    ) -> Result<SnapshotSummary, StoreError> {
        Ok(SnapshotSummary {
            parameters: self.save_parameter_definitions(&snapshot.parameters)?,
            spectra: self.save_spectrum_definitions(&snapshot.spectra)?,
            conditions: self.save_condition_definitions(&snapshot.conditions)?,
            applications: self.save_gate_applications(&snapshot.applications)?,
            variables: self.save_variables(&snapshot.variables)?,
        })
    }
}

/// Reconstructs definitions from the active save-set in the order they were
/// written.
pub struct SaveSetReader<'s> {
    store: &'s DefinitionStore,
    save_set: SaveSet,
}

impl SaveSetReader<'_> {
    #[must_use]
    pub fn save_set(&self) -> &SaveSet {
        &self.save_set
    }

    /// # Errors
    /// Returns [`StoreError::SaveSetNotFound`] when no save-set has that name.
    pub fn set_save_set(&mut self, name: &str) -> Result<(), StoreError> {
        self.save_set = self.store.require_save_set(name)?;
        Ok(())
    }

    /// Parameters in write order. Empty text in `low`, `high`, `bins` or
    /// `units` reads back as `None`, the same as SQL `NULL`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn read_parameter_definitions(&self) -> Result<Vec<ParameterDefinition>, StoreError> {
        let mut stmt = self
            .store
            .conn
            .prepare(
                "SELECT name, number, low, high, bins, units
                 FROM parameter_defs
                 WHERE save_id = ?1
                 ORDER BY id ASC",
            )
            .context("failed to prepare parameter query")?;

        let rows = stmt
            .query_map(params![self.save_set.id], |row| {
                Ok(ParameterDefinition {
                    name: row.get(0)?,
                    number: row.get(1)?,
                    low: optional_real(row, 2)?,
                    high: optional_real(row, 3)?,
                    bins: optional_integer(row, 4)?,
                    units: optional_text(row, 5)?,
                })
            })
            .context("failed to query parameter definitions")?;

        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode parameter definition")
    }

    /// Spectra in write order. The first stored axis of a spectrum is its X
    /// axis and the second its Y axis.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn read_spectrum_definitions(&self) -> Result<Vec<SpectrumDefinition>, StoreError> {
        let mut spectra: Vec<SpectrumDefinition> = Vec::new();
        let mut index_by_id: BTreeMap<i64, usize> = BTreeMap::new();

        {
            let mut stmt = self
                .store
                .conn
                .prepare(
                    "SELECT s.id, s.name, s.type, s.datatype, a.low, a.high, a.bins
                     FROM spectrum_defs s
                     LEFT JOIN axis_defs a ON a.spectrum_id = s.id
                     WHERE s.save_id = ?1
                     ORDER BY s.id ASC, a.id ASC",
                )
                .context("failed to prepare spectrum query")?;
            let mut rows =
                stmt.query(params![self.save_set.id]).context("failed to query spectra")?;

            while let Some(row) = rows.next().context("failed to read spectrum row")? {
                let spectrum_id: i64 = row.get(0).context("failed to decode spectrum id")?;
                let index = if let Some(&index) = index_by_id.get(&spectrum_id) {
                    index
                } else {
                    spectra.push(spectrum_from_row(row).context("failed to decode spectrum")?);
                    index_by_id.insert(spectrum_id, spectra.len() - 1);
                    spectra.len() - 1
                };

                let axis = (
                    row.get::<_, Option<f64>>(4),
                    row.get::<_, Option<f64>>(5),
                    row.get::<_, Option<i64>>(6),
                );
                if let (Ok(Some(low)), Ok(Some(high)), Ok(Some(bins))) = axis {
                    spectra[index].axes.push(AxisDefinition { low, high, bins });
                } else if let (Err(source), _, _) | (_, Err(source), _) | (_, _, Err(source)) = axis
                {
                    return Err(StoreError::Persistence {
                        context: "failed to decode axis definition".to_string(),
                        source,
                    });
                }
            }
        }

        for role in SpectrumParameterRole::ALL {
            let query = format!(
                "SELECT l.spectrum_id, p.name
                 FROM {} l
                 JOIN parameter_defs p ON p.id = l.parameter_id
                 JOIN spectrum_defs s ON s.id = l.spectrum_id
                 WHERE s.save_id = ?1
                 ORDER BY l.id ASC",
                role.table()
            );
            let mut stmt = self
                .store
                .conn
                .prepare(&query)
                .with_context(|| format!("failed to prepare {} query", role.table()))?;
            let rows = stmt
                .query_map(params![self.save_set.id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .with_context(|| format!("failed to query {}", role.table()))?;

            for row in rows {
                let (spectrum_id, parameter) =
                    row.with_context(|| format!("failed to decode {} row", role.table()))?;
                if let Some(&index) = index_by_id.get(&spectrum_id) {
                    role.names_mut(&mut spectra[index]).push(parameter);
                }
            }
        }

        Ok(spectra)
    }

    /// Conditions in write order, which is dependency order: components
    /// always come before the compound conditions built from them.
    ///
    /// Parameter names are soft references, so a condition whose parameters
    /// were never defined in the save-set has fewer parameter links than its
    /// type needs. Such a condition comes back as
    /// [`histdb_core::ConditionKind::Other`]
    /// under its stored type tag.
    ///
    /// # Errors
    /// Returns [`StoreError::MalformedCondition`] when stored rows do not fit
    /// the condition's type, or an error when rows cannot be read.
    pub fn read_condition_definitions(&self) -> Result<Vec<ConditionDefinition>, StoreError> {
        let roots = {
            let mut stmt = self
                .store
                .conn
                .prepare(
                    "SELECT id, name, type FROM gate_defs WHERE saveset_id = ?1 ORDER BY id ASC",
                )
                .context("failed to prepare condition query")?;
            let rows = stmt
                .query_map(params![self.save_set.id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })
                .context("failed to query conditions")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode condition row")?
        };

        let mut definitions = Vec::with_capacity(roots.len());
        for (gate_id, name, type_tag) in roots {
            let raw = RawCondition {
                points: self.load_condition_points(gate_id)?,
                parameters: self.load_condition_names(
                    "SELECT p.name FROM gate_parameters gp
                     JOIN parameter_defs p ON p.id = gp.parameter_id
                     WHERE gp.parent_gate = ?1
                     ORDER BY gp.id ASC",
                    gate_id,
                )?,
                dependencies: self.load_condition_names(
                    "SELECT g.name FROM component_gates c
                     JOIN gate_defs g ON g.id = c.child_gate
                     WHERE c.parent_gate = ?1
                     ORDER BY c.id ASC",
                    gate_id,
                )?,
                mask: self.load_condition_mask(gate_id)?,
                name: name.clone(),
                type_tag,
                low: None,
                high: None,
            };

            let definition = match ConditionDefinition::try_from(raw.clone()) {
                Ok(definition) => definition,
                Err(DefinitionError::ParameterCount { expected, found, .. }) => {
                    warn!(
                        condition = %name,
                        type_tag = %raw.type_tag,
                        expected,
                        found,
                        "condition has unlinked parameters; keeping it untyped"
                    );
                    ConditionDefinition::untyped(raw)
                }
                Err(source) => return Err(StoreError::MalformedCondition { name, source }),
            };
            definitions.push(definition);
        }

        Ok(definitions)
    }

    /// Applications in write order. Only gated spectra have rows, so every
    /// returned application has a gate.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn read_gate_applications(&self) -> Result<Vec<GateApplication>, StoreError> {
        let mut stmt = self
            .store
            .conn
            .prepare(
                "SELECT s.name, g.name
                 FROM gate_applications ga
                 JOIN spectrum_defs s ON s.id = ga.spectrum_id
                 JOIN gate_defs g ON g.id = ga.gate_id
                 WHERE s.save_id = ?1
                 ORDER BY ga.id ASC",
            )
            .context("failed to prepare gate application query")?;
        let rows = stmt
            .query_map(params![self.save_set.id], |row| {
                Ok(GateApplication { spectrum: row.get(0)?, gate: Some(row.get(1)?) })
            })
            .context("failed to query gate applications")?;

        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode gate application")
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn read_variables(&self) -> Result<Vec<TreeVariable>, StoreError> {
        let mut stmt = self
            .store
            .conn
            .prepare(
                "SELECT name, value, units FROM treevariables WHERE save_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare tree variable query")?;
        let rows = stmt
            .query_map(params![self.save_set.id], |row| {
                Ok(TreeVariable {
                    name: row.get(0)?,
                    value: row.get(1)?,
                    units: optional_text(row, 2)?.unwrap_or_default(),
                })
            })
            .context("failed to query tree variables")?;

        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode tree variable")
    }

    /// # Errors
    /// Returns the first error of the individual readers.
    pub fn read_snapshot(&self) -> Result<DefinitionSnapshot, StoreError> {
        Ok(DefinitionSnapshot {
            parameters: self.read_parameter_definitions()?,
            spectra: self.read_spectrum_definitions()?,
            conditions: self.read_condition_definitions()?,
            applications: self.read_gate_applications()?,
            variables: self.read_variables()?,
        })
    }

    fn load_condition_points(&self, gate_id: i64) -> Result<Vec<Point>, StoreError> {
        let mut stmt = self
            .store
            .conn
            .prepare_cached("SELECT x, y FROM gate_points WHERE gate_id = ?1 ORDER BY id ASC")
            .context("failed to prepare condition point query")?;
        let rows = stmt
            .query_map(params![gate_id], |row| Ok(Point { x: row.get(0)?, y: row.get(1)? }))
            .context("failed to query condition points")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode condition point")
    }

    fn load_condition_names(&self, query: &str, gate_id: i64) -> Result<Vec<String>, StoreError> {
        let mut stmt =
            self.store.conn.prepare_cached(query).context("failed to prepare condition link query")?;
        let rows = stmt
            .query_map(params![gate_id], |row| row.get::<_, String>(0))
            .context("failed to query condition links")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode condition link")
    }

    fn load_condition_mask(&self, gate_id: i64) -> Result<Option<i64>, StoreError> {
        self.store
            .conn
            .query_row(
                "SELECT mask FROM gate_masks WHERE parent_gate = ?1 ORDER BY id ASC LIMIT 1",
                params![gate_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to query condition mask")
    }
}

#[derive(Debug, Clone, Copy)]
enum SpectrumParameterRole {
    General,
    X,
    Y,
}

impl SpectrumParameterRole {
    const ALL: [Self; 3] = [Self::General, Self::X, Self::Y];

    fn table(self) -> &'static str {
        match self {
            Self::General => "spectrum_params",
            Self::X => "spectrum_x_params",
            Self::Y => "spectrum_y_params",
        }
    }

    fn names(self, definition: &SpectrumDefinition) -> &[String] {
        match self {
            Self::General => &definition.parameters,
            Self::X => &definition.xparameters,
            Self::Y => &definition.yparameters,
        }
    }

    fn names_mut(self, definition: &mut SpectrumDefinition) -> &mut Vec<String> {
        match self {
            Self::General => &mut definition.parameters,
            Self::X => &mut definition.xparameters,
            Self::Y => &mut definition.yparameters,
        }
    }
}

fn in_savepoint<T, F>(conn: &mut Connection, name: &str, work: F) -> Result<T, StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError>,
{
    let mut savepoint = conn
        .savepoint_with_name(name)
        .with_context(|| format!("failed to open savepoint {name}"))?;

    match work(&savepoint) {
        Ok(value) => {
            savepoint.commit().with_context(|| format!("failed to release savepoint {name}"))?;
            Ok(value)
        }
        Err(err) => {
            warn!(savepoint = name, error = %err, "rolling back batch");
            if let Err(rollback_err) = savepoint.rollback() {
                warn!(savepoint = name, error = %rollback_err, "rollback to savepoint failed");
            }
            Err(err)
        }
    }
}

fn insert_parameter(
    conn: &Connection,
    save_id: i64,
    definition: &ParameterDefinition,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO parameter_defs (save_id, name, number, low, high, bins, units)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            save_id,
            definition.name,
            definition.number,
            definition.low,
            definition.high,
            definition.bins,
            definition.units,
        ],
    )
    .with_context(|| format!("failed to insert parameter `{}`", definition.name))?;
    Ok(())
}

fn insert_spectrum(
    conn: &Connection,
    save_id: i64,
    definition: &SpectrumDefinition,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO spectrum_defs (save_id, name, type, datatype) VALUES (?1, ?2, ?3, ?4)",
        params![save_id, definition.name, definition.spectrum_type, definition.datatype],
    )
    .with_context(|| format!("failed to insert spectrum `{}`", definition.name))?;
    let spectrum_id = conn.last_insert_rowid();

    for axis in &definition.axes {
        conn.execute(
            "INSERT INTO axis_defs (spectrum_id, low, high, bins) VALUES (?1, ?2, ?3, ?4)",
            params![spectrum_id, axis.low, axis.high, axis.bins],
        )
        .with_context(|| format!("failed to insert axis of spectrum `{}`", definition.name))?;
    }

    for role in SpectrumParameterRole::ALL {
        let insert = format!(
            "INSERT INTO {} (spectrum_id, parameter_id)
             SELECT ?1, id FROM parameter_defs WHERE save_id = ?2 AND name = ?3",
            role.table()
        );
        for parameter in role.names(definition) {
            let linked = conn
                .execute(&insert, params![spectrum_id, save_id, parameter])
                .with_context(|| {
                    format!("failed to link parameter `{parameter}` to spectrum `{}`", definition.name)
                })?;
            if linked == 0 {
                debug!(
                    spectrum = %definition.name,
                    parameter = %parameter,
                    table = role.table(),
                    "parameter is not defined in the save set; link skipped"
                );
            }
        }
    }

    Ok(spectrum_id)
}

fn insert_condition(
    conn: &Connection,
    save_id: i64,
    definition: &ConditionDefinition,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO gate_defs (saveset_id, name, type) VALUES (?1, ?2, ?3)",
        params![save_id, definition.name, definition.type_tag()],
    )
    .with_context(|| format!("failed to insert condition `{}`", definition.name))?;
    let gate_id = conn.last_insert_rowid();

    for point in definition.points().iter() {
        conn.execute(
            "INSERT INTO gate_points (gate_id, x, y) VALUES (?1, ?2, ?3)",
            params![gate_id, point.x, point.y],
        )
        .with_context(|| format!("failed to insert point of condition `{}`", definition.name))?;
    }

    for parameter in definition.parameters() {
        let linked = conn
            .execute(
                "INSERT INTO gate_parameters (parent_gate, parameter_id)
                 SELECT ?1, id FROM parameter_defs WHERE save_id = ?2 AND name = ?3",
                params![gate_id, save_id, parameter],
            )
            .with_context(|| {
                format!("failed to link parameter `{parameter}` to condition `{}`", definition.name)
            })?;
        if linked == 0 {
            debug!(
                condition = %definition.name,
                parameter,
                "parameter is not defined in the save set; link skipped"
            );
        }
    }

    for dependency in definition.dependencies() {
        let child_gate = lookup_condition_id(conn, save_id, &definition.name, dependency)?;
        conn.execute(
            "INSERT INTO component_gates (parent_gate, child_gate) VALUES (?1, ?2)",
            params![gate_id, child_gate],
        )
        .with_context(|| {
            format!("failed to link `{dependency}` into condition `{}`", definition.name)
        })?;
    }

    if let Some(mask) = definition.mask() {
        conn.execute(
            "INSERT INTO gate_masks (parent_gate, mask) VALUES (?1, ?2)",
            params![gate_id, mask],
        )
        .with_context(|| format!("failed to insert mask of condition `{}`", definition.name))?;
    }

    Ok(gate_id)
}

fn lookup_condition_id(
    conn: &Connection,
    save_id: i64,
    condition: &str,
    dependency: &str,
) -> Result<i64, StoreError> {
    let mut stmt = conn
        .prepare_cached("SELECT id FROM gate_defs WHERE saveset_id = ?1 AND name = ?2")
        .context("failed to prepare condition lookup")?;
    let ids = stmt
        .query_map(params![save_id, dependency], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to look up condition `{dependency}`"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to look up condition `{dependency}`"))?;

    match ids.as_slice() {
        [id] => Ok(*id),
        _ => Err(StoreError::Definition(DefinitionError::DependencyNotFound {
            condition: condition.to_string(),
            dependency: dependency.to_string(),
            matches: ids.len(),
        })),
    }
}

fn insert_application(
    conn: &Connection,
    save_id: i64,
    application: &GateApplication,
) -> Result<usize, StoreError> {
    let Some(gate) = application.gate.as_deref() else {
        debug!(spectrum = %application.spectrum, "spectrum is not gated; no application row");
        return Ok(0);
    };

    let inserted = conn
        .execute(
            "INSERT INTO gate_applications (spectrum_id, gate_id)
             SELECT s.id, g.id
             FROM spectrum_defs s, gate_defs g
             WHERE s.save_id = ?1 AND s.name = ?2 AND g.saveset_id = ?1 AND g.name = ?3",
            params![save_id, application.spectrum, gate],
        )
        .with_context(|| {
            format!("failed to apply condition `{gate}` to spectrum `{}`", application.spectrum)
        })?;
    if inserted == 0 {
        debug!(
            spectrum = %application.spectrum,
            gate,
            "spectrum or condition is not defined in the save set; application skipped"
        );
    }

    Ok(inserted)
}

fn save_set_from_row(row: &Row<'_>) -> rusqlite::Result<SaveSet> {
    Ok(SaveSet { id: row.get(0)?, name: row.get(1)?, timestamp: row.get(2)? })
}

fn spectrum_from_row(row: &Row<'_>) -> rusqlite::Result<SpectrumDefinition> {
    Ok(SpectrumDefinition {
        name: row.get(1)?,
        spectrum_type: row.get(2)?,
        datatype: row.get(3)?,
        axes: Vec::new(),
        parameters: Vec::new(),
        xparameters: Vec::new(),
        yparameters: Vec::new(),
    })
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn column_text(index: usize, bytes: &[u8]) -> rusqlite::Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid UTF-8: {err}")))
}

#[allow(clippy::cast_precision_loss)]
fn optional_real(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<f64>> {
    match row.get_ref(index)? {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(value) => Ok(Some(value as f64)),
        ValueRef::Real(value) => Ok(Some(value)),
        ValueRef::Text(bytes) => {
            let text = column_text(index, bytes)?.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<f64>()
                .map(Some)
                .map_err(|err| invalid_column(index, Type::Text, format!("`{text}`: {err}")))
        }
        ValueRef::Blob(_) => Err(invalid_column(index, Type::Blob, "expected a number".to_string())),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn optional_integer(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<i64>> {
    match row.get_ref(index)? {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(value) => Ok(Some(value)),
        ValueRef::Real(value) => Ok(Some(value as i64)),
        ValueRef::Text(bytes) => {
            let text = column_text(index, bytes)?.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<i64>()
                .map(Some)
                .map_err(|err| invalid_column(index, Type::Text, format!("`{text}`: {err}")))
        }
        ValueRef::Blob(_) => {
            Err(invalid_column(index, Type::Blob, "expected an integer".to_string()))
        }
    }
}

fn optional_text(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    match row.get_ref(index)? {
        ValueRef::Null => Ok(None),
        ValueRef::Text(bytes) => {
            let text = column_text(index, bytes)?;
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        ValueRef::Integer(value) => Ok(Some(value.to_string())),
        ValueRef::Real(value) => Ok(Some(value.to_string())),
        ValueRef::Blob(_) => Err(invalid_column(index, Type::Blob, "expected text".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use histdb_core::{ConditionKind, MaskComparison, DEFAULT_SAVE_SET};

    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const ALL_TABLES: [&str; 14] = [
        "axis_defs",
        "component_gates",
        "gate_applications",
        "gate_defs",
        "gate_masks",
        "gate_parameters",
        "gate_points",
        "parameter_defs",
        "save_sets",
        "spectrum_defs",
        "spectrum_params",
        "spectrum_x_params",
        "spectrum_y_params",
        "treevariables",
    ];

    fn memory_store() -> Result<DefinitionStore, StoreError> {
        DefinitionStore::open(Path::new(":memory:"))
    }

    fn unique_temp_dir(prefix: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn count_rows(store: &DefinitionStore, table: &str) -> Result<i64, rusqlite::Error> {
        store.conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
    }

    fn mk_parameter(name: &str, number: i64) -> ParameterDefinition {
        ParameterDefinition {
            name: name.to_string(),
            number,
            low: Some(0.0),
            high: Some(4096.0),
            bins: Some(4096),
            units: Some("channels".to_string()),
        }
    }

    fn mk_parameters() -> Vec<ParameterDefinition> {
        vec![
            mk_parameter("event.raw.00", 1),
            mk_parameter("event.raw.01", 2),
            ParameterDefinition::new("event.sum", 3),
        ]
    }

    fn mk_spectra() -> Vec<SpectrumDefinition> {
        vec![
            SpectrumDefinition {
                name: "raw00".to_string(),
                spectrum_type: "1".to_string(),
                datatype: "long".to_string(),
                axes: vec![AxisDefinition { low: 0.0, high: 4096.0, bins: 4096 }],
                parameters: vec!["event.raw.00".to_string()],
                xparameters: Vec::new(),
                yparameters: Vec::new(),
            },
            SpectrumDefinition {
                name: "raw00_vs_raw01".to_string(),
                spectrum_type: "2".to_string(),
                datatype: "short".to_string(),
                axes: vec![
                    AxisDefinition { low: 0.0, high: 1024.0, bins: 256 },
                    AxisDefinition { low: -10.0, high: 10.0, bins: 20 },
                ],
                parameters: Vec::new(),
                xparameters: vec!["event.raw.00".to_string()],
                yparameters: vec!["event.raw.01".to_string()],
            },
        ]
    }

    fn mk_true(name: &str) -> ConditionDefinition {
        ConditionDefinition::new(name, ConditionKind::True)
    }

    fn mk_and(name: &str, components: &[&str]) -> ConditionDefinition {
        ConditionDefinition::new(
            name,
            ConditionKind::And {
                components: components.iter().map(ToString::to_string).collect(),
            },
        )
    }

    /// Conditions of every persisted shape, compounds listed before their
    /// components.
    fn mk_conditions() -> Vec<ConditionDefinition> {
        vec![
            ConditionDefinition::new(
                "either",
                ConditionKind::Or { components: vec!["peak".to_string(), "blob".to_string()] },
            ),
            ConditionDefinition::new("not_peak", ConditionKind::Not { component: "peak".to_string() }),
            ConditionDefinition::new(
                "peak",
                ConditionKind::Slice { parameter: "event.raw.00".to_string(), low: 100.0, high: 200.0 },
            ),
            ConditionDefinition::new(
                "blob",
                ConditionKind::Contour {
                    x_parameter: "event.raw.00".to_string(),
                    y_parameter: "event.raw.01".to_string(),
                    points: vec![
                        Point { x: 10.0, y: 10.0 },
                        Point { x: 50.0, y: 10.0 },
                        Point { x: 30.0, y: 40.0 },
                    ],
                },
            ),
            ConditionDefinition::new(
                "bits",
                ConditionKind::Mask {
                    comparison: MaskComparison::Equal,
                    parameter: "event.sum".to_string(),
                    mask: 0x0f,
                },
            ),
            ConditionDefinition::new("never", ConditionKind::False),
        ]
    }

    #[test]
    fn ensure_schema_is_idempotent() -> TestResult {
        let store = memory_store()?;
        let before = store.table_names()?;

        store.ensure_schema()?;
        store.ensure_schema()?;

        assert_eq!(store.table_names()?, before);
        for table in ALL_TABLES {
            assert!(before.iter().any(|name| name == table), "missing table {table}");
        }
        Ok(())
    }

    #[test]
    fn reopening_a_populated_file_keeps_its_definitions() -> TestResult {
        let dir = unique_temp_dir("histdb-reopen")?;
        let path = dir.join("definitions.sqlite3");

        {
            let mut store = DefinitionStore::open(&path)?;
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_parameter_definitions(&mk_parameters())?;
        }

        let store = DefinitionStore::open(&path)?;
        let parameters = store.reader(DEFAULT_SAVE_SET)?.read_parameter_definitions()?;
        assert_eq!(parameters, mk_parameters());

        drop(store);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn snapshot_round_trips_through_the_store() -> TestResult {
        let mut store = memory_store()?;
        let snapshot = DefinitionSnapshot {
            parameters: mk_parameters(),
            spectra: mk_spectra(),
            conditions: mk_conditions(),
            applications: vec![
                GateApplication { spectrum: "raw00".to_string(), gate: Some("peak".to_string()) },
                GateApplication { spectrum: "raw00_vs_raw01".to_string(), gate: None },
            ],
            variables: vec![
                TreeVariable { name: "calib.slope".to_string(), value: 1.25, units: "keV".to_string() },
                TreeVariable { name: "calib.offset".to_string(), value: -3.0, units: String::new() },
            ],
        };

        let summary = store.writer(DEFAULT_SAVE_SET)?.save_snapshot(&snapshot)?;
        assert_eq!(
            summary,
            SnapshotSummary { parameters: 3, spectra: 2, conditions: 6, applications: 1, variables: 2 }
        );

        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_snapshot()?;
        assert_eq!(loaded.parameters, snapshot.parameters);
        assert_eq!(loaded.spectra, snapshot.spectra);
        assert_eq!(loaded.variables, snapshot.variables);
        assert_eq!(loaded.applications, snapshot.applications[..1].to_vec());

        let expected_conditions = order_conditions(&snapshot.conditions)?
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(loaded.conditions, expected_conditions);
        Ok(())
    }

    #[test]
    fn compound_condition_reads_back_after_its_component() -> TestResult {
        let mut store = memory_store()?;
        let conditions = vec![mk_and("B", &["A"]), mk_true("A")];

        store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(&conditions)?;
        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_condition_definitions()?;

        let names = loaded.iter().map(|definition| definition.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(loaded[1].dependencies(), ["A".to_string()]);
        Ok(())
    }

    #[test]
    fn second_axis_is_read_back_as_y_axis() -> TestResult {
        let mut store = memory_store()?;
        {
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_parameter_definitions(&mk_parameters())?;
            writer.save_spectrum_definitions(&mk_spectra())?;
        }

        let spectra = store.reader(DEFAULT_SAVE_SET)?.read_spectrum_definitions()?;
        let two_d = &spectra[1];

        assert_eq!(two_d.x_axis(), Some(&AxisDefinition { low: 0.0, high: 1024.0, bins: 256 }));
        assert_eq!(two_d.y_axis(), Some(&AxisDefinition { low: -10.0, high: 10.0, bins: 20 }));
        assert_eq!(two_d.xparameters, vec!["event.raw.00".to_string()]);
        assert_eq!(two_d.yparameters, vec!["event.raw.01".to_string()]);
        assert!(two_d.parameters.is_empty());
        Ok(())
    }

    #[test]
    fn spectrum_naming_an_unknown_parameter_is_saved_without_the_link() -> TestResult {
        let mut store = memory_store()?;
        let spectrum = SpectrumDefinition {
            name: "orphan".to_string(),
            spectrum_type: "1".to_string(),
            datatype: "long".to_string(),
            axes: vec![AxisDefinition { low: 0.0, high: 10.0, bins: 10 }],
            parameters: vec!["not.defined".to_string()],
            xparameters: Vec::new(),
            yparameters: Vec::new(),
        };

        store.writer(DEFAULT_SAVE_SET)?.save_spectrum_definitions(std::slice::from_ref(&spectrum))?;
        let spectra = store.reader(DEFAULT_SAVE_SET)?.read_spectrum_definitions()?;

        assert_eq!(spectra.len(), 1);
        assert_eq!(spectra[0].name, "orphan");
        assert!(spectra[0].parameters.is_empty());
        assert_eq!(count_rows(&store, "spectrum_params")?, 0);
        Ok(())
    }

    #[test]
    fn failing_condition_rolls_back_the_whole_batch() -> TestResult {
        let mut store = memory_store()?;
        store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(&[mk_true("existing")])?;

        let batch = vec![
            mk_true("c1"),
            mk_true("c2"),
            mk_true("c1"),
            mk_and("c4", &["c2"]),
            mk_true("c5"),
        ];
        let err = store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(&batch);

        assert!(matches!(err, Err(StoreError::Persistence { .. })));
        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_condition_definitions()?;
        assert_eq!(loaded, vec![mk_true("existing")]);
        assert_eq!(count_rows(&store, "component_gates")?, 0);
        Ok(())
    }

    #[test]
    fn failing_spectrum_rolls_back_the_whole_batch() -> TestResult {
        let mut store = memory_store()?;
        store.conn.execute_batch(
            "CREATE TRIGGER reject_spectrum BEFORE INSERT ON spectrum_defs
             WHEN NEW.name = 'rejected'
             BEGIN SELECT RAISE(ABORT, 'spectrum rejected'); END;",
        )?;
        let mut spectra = mk_spectra();
        let rejected = SpectrumDefinition { name: "rejected".to_string(), ..spectra[0].clone() };
        spectra.push(rejected);

        let err = {
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_parameter_definitions(&mk_parameters())?;
            writer.save_spectrum_definitions(&spectra)
        };

        assert!(matches!(err, Err(StoreError::Persistence { .. })));
        assert_eq!(count_rows(&store, "spectrum_defs")?, 0);
        assert_eq!(count_rows(&store, "axis_defs")?, 0);
        assert_eq!(count_rows(&store, "spectrum_x_params")?, 0);
        assert_eq!(count_rows(&store, "parameter_defs")?, 3);
        Ok(())
    }

    #[test]
    fn failing_snapshot_batch_rolls_back_earlier_batches() -> TestResult {
        let mut store = memory_store()?;
        let snapshot = DefinitionSnapshot {
            parameters: mk_parameters(),
            spectra: mk_spectra(),
            conditions: vec![mk_true("dup"), mk_true("dup")],
            ..DefinitionSnapshot::default()
        };

        let err = store.writer(DEFAULT_SAVE_SET)?.save_snapshot(&snapshot);

        assert!(err.is_err());
        assert_eq!(count_rows(&store, "parameter_defs")?, 0);
        assert_eq!(count_rows(&store, "spectrum_defs")?, 0);
        assert_eq!(count_rows(&store, "gate_defs")?, 0);
        Ok(())
    }

    #[test]
    fn only_gated_spectra_get_application_rows() -> TestResult {
        let mut store = memory_store()?;
        let spectra = ["s1", "s2"]
            .iter()
            .map(|name| SpectrumDefinition {
                name: (*name).to_string(),
                spectrum_type: "1".to_string(),
                datatype: "long".to_string(),
                axes: vec![AxisDefinition { low: 0.0, high: 1.0, bins: 1 }],
                parameters: Vec::new(),
                xparameters: Vec::new(),
                yparameters: Vec::new(),
            })
            .collect::<Vec<_>>();

        let written = {
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_spectrum_definitions(&spectra)?;
            writer.save_condition_definitions(&[mk_true("g1")])?;
            writer.save_gate_applications(&[
                GateApplication { spectrum: "s1".to_string(), gate: Some("g1".to_string()) },
                GateApplication { spectrum: "s2".to_string(), gate: None },
            ])?
        };

        assert_eq!(written, 1);
        assert_eq!(count_rows(&store, "gate_applications")?, 1);
        let applications = store.reader(DEFAULT_SAVE_SET)?.read_gate_applications()?;
        assert_eq!(
            applications,
            vec![GateApplication { spectrum: "s1".to_string(), gate: Some("g1".to_string()) }]
        );
        Ok(())
    }

    #[test]
    fn empty_application_list_writes_nothing() -> TestResult {
        let mut store = memory_store()?;
        let written = store.writer(DEFAULT_SAVE_SET)?.save_gate_applications(&[])?;
        assert_eq!(written, 0);
        assert_eq!(count_rows(&store, "gate_applications")?, 0);
        Ok(())
    }

    #[test]
    fn unknown_dependency_is_rejected_before_writing() -> TestResult {
        let mut store = memory_store()?;

        let err = store
            .writer(DEFAULT_SAVE_SET)?
            .save_condition_definitions(&[mk_true("A"), mk_and("B", &["missing"])]);

        assert!(matches!(
            err,
            Err(StoreError::Definition(DefinitionError::DependencyNotFound { ref dependency, matches: 0, .. }))
                if dependency == "missing"
        ));
        assert_eq!(count_rows(&store, "gate_defs")?, 0);
        Ok(())
    }

    #[test]
    fn ambiguous_stored_dependency_rolls_back_the_batch() -> TestResult {
        let mut store = memory_store()?;
        store.conn.execute_batch("DROP INDEX idx_gate_defs_name;")?;
        store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(&[mk_true("A")])?;

        let err = store
            .writer(DEFAULT_SAVE_SET)?
            .save_condition_definitions(&[mk_true("A"), mk_and("B", &["A"])]);

        assert!(matches!(
            err,
            Err(StoreError::Definition(DefinitionError::DependencyNotFound { matches: 2, .. }))
        ));
        assert_eq!(count_rows(&store, "gate_defs")?, 1);
        Ok(())
    }

    #[test]
    fn cyclic_conditions_are_rejected_before_writing() -> TestResult {
        let mut store = memory_store()?;

        let err = store
            .writer(DEFAULT_SAVE_SET)?
            .save_condition_definitions(&[mk_and("A", &["B"]), mk_and("B", &["A"])]);

        assert!(matches!(
            err,
            Err(StoreError::Definition(DefinitionError::CyclicDependency { .. }))
        ));
        assert_eq!(count_rows(&store, "gate_defs")?, 0);
        Ok(())
    }

    #[test]
    fn reader_requires_an_existing_save_set() -> TestResult {
        let store = memory_store()?;

        let missing = store.reader("no_such_set");
        assert!(matches!(missing, Err(StoreError::SaveSetNotFound(ref name)) if name == "no_such_set"));

        store.create_save_set("present")?;
        let mut reader = store.reader("present")?;
        let switched = reader.set_save_set("still_missing");
        assert!(matches!(switched, Err(StoreError::SaveSetNotFound(_))));
        assert_eq!(reader.save_set().name, "present");
        Ok(())
    }

    #[test]
    fn empty_and_null_values_read_back_as_absent() -> TestResult {
        let mut store = memory_store()?;
        store
            .writer(DEFAULT_SAVE_SET)?
            .save_parameter_definitions(&[ParameterDefinition::new("bare", 7)])?;
        let save_id = store.find_save_set(DEFAULT_SAVE_SET)?.map(|set| set.id);
        store.conn.execute(
            "INSERT INTO parameter_defs (save_id, name, number, low, high, bins, units)
             VALUES (?1, 'legacy', 8, '', '', '', '')",
            params![save_id],
        )?;

        let parameters = store.reader(DEFAULT_SAVE_SET)?.read_parameter_definitions()?;

        assert_eq!(parameters, vec![ParameterDefinition::new("bare", 7), ParameterDefinition::new("legacy", 8)]);
        Ok(())
    }

    #[test]
    fn save_sets_are_isolated_and_deletable() -> TestResult {
        let mut store = memory_store()?;
        {
            let mut writer = store.writer("first")?;
            writer.save_parameter_definitions(&mk_parameters())?;
            writer.save_spectrum_definitions(&mk_spectra())?;
            writer.save_condition_definitions(&mk_conditions())?;
            writer.save_gate_applications(&[GateApplication {
                spectrum: "raw00".to_string(),
                gate: Some("either".to_string()),
            }])?;
            writer.save_variables(&[TreeVariable {
                name: "gain".to_string(),
                value: 2.0,
                units: "x".to_string(),
            }])?;

            writer.set_save_set("second")?;
            writer.save_parameter_definitions(&mk_parameters()[..1])?;
            writer.save_condition_definitions(&[mk_true("other")])?;
        }

        let names = store.list_save_sets()?.into_iter().map(|set| set.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(store.reader("second")?.read_parameter_definitions()?.len(), 1);

        assert!(store.delete_save_set("first")?);
        assert!(!store.delete_save_set("first")?);

        for table in ["spectrum_defs", "axis_defs", "gate_points", "gate_masks", "component_gates"] {
            assert_eq!(count_rows(&store, table)?, 0, "{table} should be empty");
        }
        assert_eq!(count_rows(&store, "treevariables")?, 0);
        let remaining = store.reader("second")?.read_snapshot()?;
        assert_eq!(remaining.parameters.len(), 1);
        assert_eq!(remaining.conditions, vec![mk_true("other")]);
        assert!(store.integrity_check()?.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn replacing_a_save_set_swaps_its_contents() -> TestResult {
        let mut store = memory_store()?;
        store.writer(DEFAULT_SAVE_SET)?.save_snapshot(&DefinitionSnapshot {
            parameters: mk_parameters(),
            conditions: vec![mk_true("old")],
            ..DefinitionSnapshot::default()
        })?;

        let replacement = DefinitionSnapshot {
            parameters: mk_parameters()[..1].to_vec(),
            conditions: vec![mk_and("B", &["A"]), mk_true("A")],
            ..DefinitionSnapshot::default()
        };
        let summary = store.replace_save_set(DEFAULT_SAVE_SET, &replacement)?;
        assert_eq!(summary.parameters, 1);
        assert_eq!(summary.conditions, 2);

        let failing = DefinitionSnapshot {
            conditions: vec![mk_and("loop", &["loop"])],
            ..DefinitionSnapshot::default()
        };
        assert!(store.replace_save_set(DEFAULT_SAVE_SET, &failing).is_err());

        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_snapshot()?;
        assert_eq!(loaded.parameters, mk_parameters()[..1].to_vec());
        assert_eq!(loaded.conditions, vec![mk_true("A"), mk_and("B", &["A"])]);
        assert_eq!(store.list_save_sets()?.len(), 1);
        Ok(())
    }

    fn mk_slice(name: &str, parameter: &str) -> ConditionDefinition {
        ConditionDefinition::new(
            name,
            ConditionKind::Slice { parameter: parameter.to_string(), low: 100.0, high: 200.0 },
        )
    }

    #[test]
    fn condition_on_undefined_parameter_does_not_block_the_save_set() -> TestResult {
        let mut store = memory_store()?;
        {
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_parameter_definitions(&mk_parameters())?;
            writer.save_condition_definitions(&[
                mk_slice("peak", "undefined"),
                mk_true("ok"),
                mk_slice("good", "event.raw.00"),
            ])?;
        }

        let reader = store.reader(DEFAULT_SAVE_SET)?;
        let loaded = reader.read_condition_definitions()?;

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].type_tag(), "s");
        assert_eq!(
            loaded[0].kind,
            ConditionKind::Other {
                type_tag: "s".to_string(),
                parameters: Vec::new(),
                points: vec![Point { x: 100.0, y: 0.0 }, Point { x: 200.0, y: 0.0 }],
                dependencies: Vec::new(),
                low: None,
                high: None,
                mask: None,
            }
        );
        assert_eq!(loaded[1], mk_true("ok"));
        assert_eq!(loaded[2], mk_slice("good", "event.raw.00"));
        assert_eq!(reader.read_snapshot()?.conditions, loaded);
        Ok(())
    }

    #[test]
    fn gamma_band_and_generic_conditions_round_trip() -> TestResult {
        let mut store = memory_store()?;
        let outline = vec![
            Point { x: 1.0, y: 2.0 },
            Point { x: 3.0, y: 4.0 },
            Point { x: 5.0, y: 1.0 },
        ];
        let raw_pair = vec!["event.raw.00".to_string(), "event.raw.01".to_string()];
        let conditions = vec![
            ConditionDefinition::new(
                "band",
                ConditionKind::Band {
                    x_parameter: "event.raw.00".to_string(),
                    y_parameter: "event.raw.01".to_string(),
                    points: outline.clone(),
                },
            ),
            ConditionDefinition::new(
                "gslice",
                ConditionKind::GammaSlice { parameters: raw_pair.clone(), low: 5.0, high: 50.0 },
            ),
            ConditionDefinition::new(
                "gcontour",
                ConditionKind::GammaContour { parameters: raw_pair.clone(), points: outline.clone() },
            ),
            ConditionDefinition::new(
                "gband",
                ConditionKind::GammaBand { parameters: raw_pair, points: outline.clone() },
            ),
            ConditionDefinition::new(
                "generic",
                ConditionKind::Other {
                    type_tag: "zz".to_string(),
                    parameters: vec!["event.sum".to_string()],
                    points: outline,
                    dependencies: vec!["band".to_string(), "gband".to_string()],
                    low: None,
                    high: None,
                    mask: Some(3),
                },
            ),
        ];

        {
            let mut writer = store.writer(DEFAULT_SAVE_SET)?;
            writer.save_parameter_definitions(&mk_parameters())?;
            writer.save_condition_definitions(&conditions)?;
        }
        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_condition_definitions()?;

        assert_eq!(loaded, conditions);
        assert_eq!(count_rows(&store, "gate_masks")?, 1);
        assert_eq!(count_rows(&store, "component_gates")?, 2);
        Ok(())
    }

    #[test]
    fn generic_condition_range_is_stored_as_points() -> TestResult {
        let mut store = memory_store()?;
        let ranged = ConditionDefinition::new(
            "ranged",
            ConditionKind::Other {
                type_tag: "yy".to_string(),
                parameters: Vec::new(),
                points: Vec::new(),
                dependencies: Vec::new(),
                low: Some(1.0),
                high: Some(5.0),
                mask: None,
            },
        );

        store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(std::slice::from_ref(&ranged))?;
        let loaded = store.reader(DEFAULT_SAVE_SET)?.read_condition_definitions()?;

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].type_tag(), "yy");
        assert_eq!(loaded[0].points(), ranged.points());
        assert_eq!(count_rows(&store, "gate_points")?, 2);
        Ok(())
    }

    #[test]
    fn stored_shape_that_fits_no_type_is_malformed() -> TestResult {
        let mut store = memory_store()?;
        store.writer(DEFAULT_SAVE_SET)?.save_condition_definitions(&[mk_true("A")])?;
        let save_id = store.find_save_set(DEFAULT_SAVE_SET)?.map(|set| set.id);
        store.conn.execute(
            "INSERT INTO gate_defs (saveset_id, name, type) VALUES (?1, 'broken', '-')",
            params![save_id],
        )?;

        let err = store.reader(DEFAULT_SAVE_SET)?.read_condition_definitions();

        assert!(matches!(
            err,
            Err(StoreError::MalformedCondition { ref name, source: DefinitionError::Validation(_) })
                if name == "broken"
        ));
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> TestResult {
        let mut store = memory_store()?;
        store.writer(DEFAULT_SAVE_SET)?.save_snapshot(&DefinitionSnapshot {
            parameters: mk_parameters(),
            spectra: mk_spectra(),
            conditions: mk_conditions(),
            ..DefinitionSnapshot::default()
        })?;

        let report = store.integrity_check()?;

        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }
}

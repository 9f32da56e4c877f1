use anyhow::{Context, Result};
use chrono::Utc;
use ecu_synth_schemas::{
    Component, ContentHash, DocumentCategory, Dtc, DtcRelation, EcuTopology, IdempotencyRecord, InferenceType,
    IoSignal, PhysicalQuantity, Run, RunId, RunStatus, Unit, SYSTEM_CONFIGS,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Typed edges between stored entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Component -> circuit diagram hash
    ExtractedFrom,
    /// Component -> system description hash
    CheckedIn,
    /// IO -> component
    MappedTo,
    /// IO list hash -> IO
    Contains,
    /// DTC -> component
    Affects,
    /// Physical quantity -> unit
    HasUnit,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::ExtractedFrom => "HAS_BEEN_EXTRACTED_FROM",
            Relation::CheckedIn => "HAS_BEEN_CHECKED_IN",
            Relation::MappedTo => "MAPPED_TO",
            Relation::Contains => "CONTAINS",
            Relation::Affects => "AFFECTS",
            Relation::HasUnit => "HAS_UNIT",
        }
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store and make sure every table exists
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store folder {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store {}", path.display()))?;

        let db = Self { conn };
        db.init_schema()?;
        db.seed_topology()?;

        info!("Database initialized");
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        // === ENTITIES ===

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS components (
                name TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                more_description TEXT NOT NULL DEFAULT '',
                purpose TEXT NOT NULL DEFAULT '',
                exported INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (name, ecu_system)
            )",
            [],
        )?;

        // HAS_META: description snippets found per system description document
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS component_meta (
                component TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                description TEXT NOT NULL,
                PRIMARY KEY (component, ecu_system, content_hash)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS dtcs (
                code TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                heading TEXT NOT NULL,
                detection TEXT NOT NULL,
                cause TEXT NOT NULL,
                system_reaction TEXT NOT NULL,
                symptom TEXT NOT NULL,
                component_refs TEXT NOT NULL,
                PRIMARY KEY (code, ecu_system)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS ios (
                name TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                description TEXT NOT NULL,
                name_presentation TEXT NOT NULL,
                PRIMARY KEY (name, ecu_system)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS physical_quantities (
                name TEXT PRIMARY KEY,
                name_presentation TEXT NOT NULL,
                standard_unit TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS units (
                name TEXT NOT NULL,
                physical_quantity TEXT NOT NULL,
                name_presentation TEXT NOT NULL,
                factor REAL,
                PRIMARY KEY (name, physical_quantity)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS topology (
                system TEXT PRIMARY KEY,
                family TEXT NOT NULL,
                server TEXT NOT NULL
            )",
            [],
        )?;

        // === RELATIONS ===

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS edges (
                relation TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                PRIMARY KEY (relation, ecu_system, source, target)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(relation, ecu_system, target)",
            [],
        )?;

        // === BOOKKEEPING ===

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                category TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                ecu_system TEXT NOT NULL,
                filename TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (category, content_hash, ecu_system)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                ecu TEXT NOT NULL,
                version INTEGER NOT NULL,
                inference_type TEXT NOT NULL,
                status TEXT NOT NULL,
                messages TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_ecu_version ON runs(ecu, version)",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS function_trees (
                name TEXT PRIMARY KEY,
                xml TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Seed family HAS_SYSTEM system USES_SERVER server from the static table
    fn seed_topology(&self) -> Result<()> {
        for config in SYSTEM_CONFIGS {
            let Some(server) = config.server_can else {
                continue;
            };
            self.conn.execute(
                "INSERT INTO topology (system, family, server) VALUES (?1, ?2, ?3)
                 ON CONFLICT(system) DO UPDATE SET family = excluded.family, server = excluded.server",
                params![config.execution, config.family, server],
            )?;
        }
        Ok(())
    }

    pub fn topology_for_system(&self, system: &str) -> Result<Option<EcuTopology>> {
        let topology = self
            .conn
            .query_row(
                "SELECT family, system, server FROM topology WHERE system = ?1",
                params![system],
                |row| {
                    Ok(EcuTopology {
                        family: row.get(0)?,
                        system: row.get(1)?,
                        server: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(topology)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    fn row_to_component(row: &Row) -> rusqlite::Result<Component> {
        Ok(Component {
            name: row.get(0)?,
            ecu_system: row.get(1)?,
            description: row.get(2)?,
            more_description: row.get(3)?,
            purpose: row.get(4)?,
            exported: row.get::<_, i64>(5)? != 0,
        })
    }

    /// Upsert a component's short description.
    ///
    /// Returns true when the row was created or its description changed, in
    /// which case `exported` is reset. Other descriptive fields are untouched.
    pub fn upsert_component_description(&self, name: &str, ecu_system: &str, description: &str) -> Result<bool> {
        let previous = self.get_component(name, ecu_system)?;
        let changed = previous
            .as_ref()
            .map_or(true, |component| component.description != description);

        self.conn.execute(
            "INSERT INTO components (name, ecu_system, description, exported, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(name, ecu_system) DO UPDATE SET
                exported = CASE WHEN components.description = excluded.description
                                THEN components.exported ELSE 0 END,
                description = excluded.description,
                updated_at = excluded.updated_at",
            params![name, ecu_system, description, Utc::now().to_rfc3339()],
        )?;

        debug!("Upserted component {} ({})", name, ecu_system);
        Ok(changed)
    }

    /// Set the long description and/or purpose; `None` leaves a field as is.
    pub fn update_component_details(
        &self,
        name: &str,
        ecu_system: &str,
        more_description: Option<&str>,
        purpose: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE components SET
                more_description = COALESCE(?3, more_description),
                purpose = COALESCE(?4, purpose),
                exported = 0,
                updated_at = ?5
             WHERE name = ?1 AND ecu_system = ?2",
            params![name, ecu_system, more_description, purpose, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_component_exported(&self, name: &str, ecu_system: &str, exported: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE components SET exported = ?3, updated_at = ?4 WHERE name = ?1 AND ecu_system = ?2",
            params![name, ecu_system, exported as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_component(&self, name: &str, ecu_system: &str) -> Result<Option<Component>> {
        let component = self
            .conn
            .query_row(
                "SELECT name, ecu_system, description, more_description, purpose, exported
                 FROM components WHERE name = ?1 AND ecu_system = ?2",
                params![name, ecu_system],
                Self::row_to_component,
            )
            .optional()?;
        Ok(component)
    }

    /// All components of one ECU system, ordered by name
    pub fn components_for_system(&self, ecu_system: &str) -> Result<Vec<Component>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, ecu_system, description, more_description, purpose, exported
             FROM components WHERE ecu_system = ?1 AND name != '' ORDER BY name",
        )?;
        let components = stmt
            .query_map(params![ecu_system], Self::row_to_component)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(components)
    }

    pub fn count_components(&self, ecu_system: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM components WHERE ecu_system = ?1",
            params![ecu_system],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn add_component_meta(&self, name: &str, ecu_system: &str, hash: &ContentHash, description: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO component_meta (component, ecu_system, content_hash, description)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(component, ecu_system, content_hash) DO UPDATE SET description = excluded.description",
            params![name, ecu_system, hash.0, description],
        )?;
        Ok(())
    }

    pub fn component_meta(&self, name: &str, ecu_system: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT description FROM component_meta
             WHERE component = ?1 AND ecu_system = ?2 AND description != ''
             ORDER BY content_hash",
        )?;
        let meta = stmt
            .query_map(params![name, ecu_system], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(meta)
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Merge an edge; linking twice leaves one edge
    pub fn link(&self, relation: Relation, ecu_system: &str, source: &str, target: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO edges (relation, ecu_system, source, target) VALUES (?1, ?2, ?3, ?4)",
            params![relation.as_str(), ecu_system, source, target],
        )?;
        Ok(())
    }

    pub fn has_link(&self, relation: Relation, ecu_system: &str, source: &str, target: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM edges WHERE relation = ?1 AND ecu_system = ?2 AND source = ?3 AND target = ?4",
                params![relation.as_str(), ecu_system, source, target],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn linked_targets(&self, relation: Relation, ecu_system: &str, source: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT target FROM edges WHERE relation = ?1 AND ecu_system = ?2 AND source = ?3 ORDER BY target",
        )?;
        let targets = stmt
            .query_map(params![relation.as_str(), ecu_system, source], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(targets)
    }

    pub fn linked_sources(&self, relation: Relation, ecu_system: &str, target: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT source FROM edges WHERE relation = ?1 AND ecu_system = ?2 AND target = ?3 ORDER BY source",
        )?;
        let sources = stmt
            .query_map(params![relation.as_str(), ecu_system, target], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(sources)
    }

    pub fn count_links(&self, relation: Relation, ecu_system: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE relation = ?1 AND ecu_system = ?2",
            params![relation.as_str(), ecu_system],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Components of `ecu_system` not yet checked against the document `hash`,
    /// excluding `excluded` names
    pub fn components_unchecked_in(
        &self,
        ecu_system: &str,
        hash: &ContentHash,
        excluded: &HashSet<String>,
    ) -> Result<Vec<Component>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.name, c.ecu_system, c.description, c.more_description, c.purpose, c.exported
             FROM components c
             WHERE c.ecu_system = ?1 AND c.name != ''
               AND NOT EXISTS (
                   SELECT 1 FROM edges e
                   WHERE e.relation = ?2 AND e.ecu_system = c.ecu_system
                     AND e.source = c.name AND e.target = ?3
               )
             ORDER BY c.name",
        )?;
        let components = stmt
            .query_map(
                params![ecu_system, Relation::CheckedIn.as_str(), hash.0],
                Self::row_to_component,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(components
            .into_iter()
            .filter(|component| !excluded.contains(&component.name))
            .collect())
    }

    // ------------------------------------------------------------------
    // DTCs
    // ------------------------------------------------------------------

    pub fn upsert_dtc(&self, dtc: &Dtc) -> Result<()> {
        let refs = serde_json::to_string(&dtc.component_refs)?;
        self.conn.execute(
            "INSERT INTO dtcs (code, ecu_system, heading, detection, cause, system_reaction, symptom, component_refs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(code, ecu_system) DO UPDATE SET
                heading = excluded.heading,
                detection = excluded.detection,
                cause = excluded.cause,
                system_reaction = excluded.system_reaction,
                symptom = excluded.symptom,
                component_refs = excluded.component_refs",
            params![
                dtc.code,
                dtc.ecu_system,
                dtc.heading,
                dtc.detection,
                dtc.cause,
                dtc.system_reaction,
                dtc.symptom,
                refs,
            ],
        )?;
        debug!("Upserted DTC {} ({})", dtc.code, dtc.ecu_system);
        Ok(())
    }

    pub fn get_dtc(&self, code: &str, ecu_system: &str) -> Result<Option<Dtc>> {
        let dtc = self
            .conn
            .query_row(
                "SELECT code, ecu_system, heading, detection, cause, system_reaction, symptom, component_refs
                 FROM dtcs WHERE code = ?1 AND ecu_system = ?2",
                params![code, ecu_system],
                |row| {
                    let refs: String = row.get(7)?;
                    let component_refs = serde_json::from_str(&refs)
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
                    Ok(Dtc {
                        code: row.get(0)?,
                        ecu_system: row.get(1)?,
                        heading: row.get(2)?,
                        detection: row.get(3)?,
                        cause: row.get(4)?,
                        system_reaction: row.get(5)?,
                        symptom: row.get(6)?,
                        component_refs,
                    })
                },
            )
            .optional()?;
        Ok(dtc)
    }

    pub fn count_dtcs(&self, ecu_system: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dtcs WHERE ecu_system = ?1",
            params![ecu_system],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// (DTC, affected component) pairs, minus components in `excluded`
    pub fn dtc_relations(&self, ecu_system: &str, excluded: &HashSet<String>) -> Result<Vec<DtcRelation>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT d.code, d.heading, e.target
             FROM dtcs d
             JOIN edges e ON e.relation = ?1 AND e.ecu_system = d.ecu_system AND e.source = d.code
             WHERE d.ecu_system = ?2
             ORDER BY d.code, e.target",
        )?;
        let relations = stmt
            .query_map(params![Relation::Affects.as_str(), ecu_system], |row| {
                Ok(DtcRelation {
                    code: row.get(0)?,
                    heading: row.get(1)?,
                    component_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(relations
            .into_iter()
            .filter(|relation| !relation.component_name.is_empty() && !excluded.contains(&relation.component_name))
            .collect())
    }

    // ------------------------------------------------------------------
    // IOs
    // ------------------------------------------------------------------

    pub fn upsert_io(&self, io: &IoSignal) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ios (name, ecu_system, description, name_presentation)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, ecu_system) DO UPDATE SET
                description = excluded.description,
                name_presentation = excluded.name_presentation",
            params![io.name, io.ecu_system, io.description, io.name_presentation],
        )?;
        Ok(())
    }

    pub fn get_io(&self, name: &str, ecu_system: &str) -> Result<Option<IoSignal>> {
        let io = self
            .conn
            .query_row(
                "SELECT name, description, name_presentation, ecu_system FROM ios
                 WHERE name = ?1 AND ecu_system = ?2",
                params![name, ecu_system],
                |row| {
                    Ok(IoSignal {
                        name: row.get(0)?,
                        description: row.get(1)?,
                        name_presentation: row.get(2)?,
                        ecu_system: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(io)
    }

    pub fn count_ios(&self, ecu_system: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ios WHERE ecu_system = ?1",
            params![ecu_system],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Physical quantities
    // ------------------------------------------------------------------

    /// Store a physical quantity with its units. Returns true when it was new.
    pub fn upsert_physical_quantity(&self, quantity: &PhysicalQuantity) -> Result<bool> {
        let existed = self.get_physical_quantity(&quantity.name)?.is_some();

        self.conn.execute(
            "INSERT INTO physical_quantities (name, name_presentation, standard_unit)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                name_presentation = excluded.name_presentation,
                standard_unit = excluded.standard_unit",
            params![quantity.name, quantity.name_presentation, quantity.standard_unit],
        )?;

        for unit in &quantity.units {
            self.conn.execute(
                "INSERT INTO units (name, physical_quantity, name_presentation, factor)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name, physical_quantity) DO UPDATE SET
                    name_presentation = excluded.name_presentation,
                    factor = excluded.factor",
                params![unit.name, quantity.name, unit.name_presentation, unit.factor],
            )?;
            self.link(Relation::HasUnit, "", &quantity.name, &unit.name)?;
        }

        Ok(!existed)
    }

    fn units_of(&self, quantity: &str) -> Result<Vec<Unit>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, name_presentation, factor FROM units WHERE physical_quantity = ?1 ORDER BY name",
        )?;
        let units = stmt
            .query_map(params![quantity], |row| {
                Ok(Unit {
                    name: row.get(0)?,
                    name_presentation: row.get(1)?,
                    factor: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    pub fn get_physical_quantity(&self, name: &str) -> Result<Option<PhysicalQuantity>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT name, name_presentation, standard_unit FROM physical_quantities WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((name, name_presentation, standard_unit)) => {
                let units = self.units_of(&name)?;
                Ok(Some(PhysicalQuantity {
                    name,
                    name_presentation,
                    standard_unit,
                    units,
                }))
            }
            None => Ok(None),
        }
    }

    /// Physical quantities having a unit named `unit`
    pub fn physical_quantities_with_unit(&self, unit: &str) -> Result<Vec<PhysicalQuantity>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT physical_quantity FROM units WHERE name = ?1 ORDER BY physical_quantity",
        )?;
        let names = stmt
            .query_map(params![unit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut quantities = Vec::new();
        for name in names {
            if let Some(quantity) = self.get_physical_quantity(&name)? {
                quantities.push(quantity);
            }
        }
        Ok(quantities)
    }

    pub fn physical_quantities(&self) -> Result<Vec<PhysicalQuantity>> {
        let mut stmt = self.conn.prepare("SELECT name FROM physical_quantities ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut quantities = Vec::new();
        for name in names {
            if let Some(quantity) = self.get_physical_quantity(&name)? {
                quantities.push(quantity);
            }
        }
        Ok(quantities)
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    pub fn ledger_records(&self, category: DocumentCategory) -> Result<Vec<IdempotencyRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT content_hash, filename, ecu_system FROM ledger WHERE category = ?1 ORDER BY created_at",
        )?;
        let records = stmt
            .query_map(params![category.as_str()], |row| {
                Ok(IdempotencyRecord {
                    content_hash: ContentHash(row.get(0)?),
                    filename: row.get(1)?,
                    ecu_system: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn insert_ledger_record(&self, category: DocumentCategory, record: &IdempotencyRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ledger (category, content_hash, ecu_system, filename, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(category, content_hash, ecu_system) DO UPDATE SET filename = excluded.filename",
            params![
                category.as_str(),
                record.content_hash.0,
                record.ecu_system,
                record.filename,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_ledger_records(&self, category: DocumentCategory, ecu_system: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM ledger WHERE category = ?1 AND ecu_system = ?2",
            params![category.as_str(), ecu_system],
        )?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
        let inference_type: String = row.get(3)?;
        let status: String = row.get(4)?;
        let messages: String = row.get(5)?;

        let inference_type = InferenceType::parse(&inference_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("bad type {}", inference_type).into())
        })?;
        let status = RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, format!("bad status {}", status).into())
        })?;
        let messages = serde_json::from_str(&messages)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        Ok(Run {
            id: RunId(row.get(0)?),
            ecu: row.get(1)?,
            version: row.get(2)?,
            inference_type,
            status,
            messages,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (id, ecu, version, inference_type, status, messages, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id.0,
                run.ecu,
                run.version,
                run.inference_type.as_str(),
                run.status.as_str(),
                serde_json::to_string(&run.messages)?,
                run.created_at,
                run.updated_at,
            ],
        )?;
        debug!("Inserted run: {}", run.id);
        Ok(())
    }

    pub fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, ecu, version, inference_type, status, messages, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id.0],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn runs_for_ecu(&self, ecu: &str) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ecu, version, inference_type, status, messages, created_at, updated_at
             FROM runs WHERE ecu = ?1 ORDER BY version",
        )?;
        let runs = stmt
            .query_map(params![ecu], Self::row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn latest_version(&self, ecu: &str) -> Result<Option<u32>> {
        let version: Option<u32> = self.conn.query_row(
            "SELECT MAX(version) FROM runs WHERE ecu = ?1",
            params![ecu],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn update_run_status(&self, id: &RunId, status: RunStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.0, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn append_run_message(&self, id: &RunId, message: &str) -> Result<()> {
        let current: Option<String> = self
            .conn
            .query_row("SELECT messages FROM runs WHERE id = ?1", params![id.0], |row| row.get(0))
            .optional()?;
        let Some(current) = current else {
            return Ok(());
        };

        let mut messages: Vec<String> = serde_json::from_str(&current)?;
        messages.push(message.to_string());
        self.conn.execute(
            "UPDATE runs SET messages = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.0, serde_json::to_string(&messages)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Function trees
    // ------------------------------------------------------------------

    pub fn save_function_tree(&self, name: &str, xml: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO function_trees (name, xml, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET xml = excluded.xml, updated_at = excluded.updated_at",
            params![name, xml, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The most recently saved function tree
    pub fn load_function_tree(&self) -> Result<Option<String>> {
        let xml = self
            .conn
            .query_row(
                "SELECT xml FROM function_trees ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(xml)
    }
}

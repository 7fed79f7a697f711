//! In-memory stand-in for the PostgreSQL catalog.
//!
//! Understands exactly the statement templates the stores issue, keeps a
//! committed catalog plus a private working copy per transaction, and mimics
//! PostgreSQL's aborted-transaction behaviour after a failed statement.

use crate::error::{GatewayError, Result};
use crate::provisioning::executor::{ConnectionProvisioner, QueryOutcome, SqlRow, Transaction};
use crate::provisioning::model::{Credentials, RequestContext};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio_postgres::error::SqlState;

const SESSION_USER: &str = "postgres";

#[derive(Debug, Clone)]
struct FakeSchema {
    owner: String,
    acl: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct FakeRole {
    oid: u32,
    search_path: Option<String>,
    superuser: bool,
    members: BTreeSet<String>,
    /// Schemas this role holds granted privileges on.
    privileges: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    schemas: BTreeMap<String, FakeSchema>,
    roles: BTreeMap<String, FakeRole>,
    next_oid: u32,
}

impl Catalog {
    fn bootstrap() -> Self {
        let mut catalog = Catalog {
            next_oid: 16384,
            ..Default::default()
        };
        for builtin in ["public", "information_schema", "pg_catalog", "pg_toast"] {
            catalog.schemas.insert(
                builtin.to_string(),
                FakeSchema {
                    owner: SESSION_USER.to_string(),
                    acl: Vec::new(),
                },
            );
        }
        catalog.add_role(SESSION_USER, None, true);
        catalog
    }

    fn add_role(&mut self, name: &str, search_path: Option<&str>, superuser: bool) {
        self.next_oid += 1;
        self.roles.insert(
            name.to_string(),
            FakeRole {
                oid: self.next_oid,
                search_path: search_path.map(str::to_string),
                superuser,
                members: BTreeSet::new(),
                privileges: BTreeSet::new(),
            },
        );
    }

    fn require_role(&self, name: &str) -> Result<()> {
        if self.roles.contains_key(name) {
            Ok(())
        } else {
            Err(pg_error(format!("role \"{}\" does not exist", name)))
        }
    }

    fn require_schema(&self, name: &str) -> Result<()> {
        if self.schemas.contains_key(name) {
            Ok(())
        } else {
            Err(pg_error(format!("schema \"{}\" does not exist", name)))
        }
    }
}

#[derive(Default)]
struct Shared {
    committed: Catalog,
    databases: Vec<String>,
    statements: Vec<String>,
    failures: Vec<String>,
    races: Vec<String>,
    opened: Vec<String>,
    commit_attempts: usize,
    failing_commit: Option<usize>,
    commits: usize,
    rollbacks: usize,
    fail_rollbacks: bool,
    fail_connections: bool,
}

#[derive(Clone)]
pub(crate) struct FakeDatabase {
    shared: Arc<Mutex<Shared>>,
}

impl FakeDatabase {
    pub(crate) fn new() -> Self {
        let shared = Shared {
            committed: Catalog::bootstrap(),
            databases: vec!["postgres".to_string(), "tenants".to_string()],
            ..Default::default()
        };
        Self {
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        f(&mut self.shared.lock().unwrap())
    }

    pub(crate) fn seed_schema(&self, name: &str, owner: &str) {
        self.with(|s| {
            s.committed.schemas.insert(
                name.to_string(),
                FakeSchema {
                    owner: owner.to_string(),
                    acl: Vec::new(),
                },
            );
        });
    }

    pub(crate) fn seed_acl(&self, schema: &str, acl: &str) {
        self.with(|s| {
            if let Some(entry) = s.committed.schemas.get_mut(schema) {
                entry.acl = acl
                    .trim_matches(|c| c == '{' || c == '}')
                    .split(',')
                    .map(str::to_string)
                    .collect();
            }
        });
    }

    pub(crate) fn seed_role(&self, name: &str) {
        self.with(|s| s.committed.add_role(name, None, false));
    }

    pub(crate) fn seed_role_with_search_path(&self, name: &str, schema: &str) {
        self.with(|s| s.committed.add_role(name, Some(schema), false));
    }

    pub(crate) fn seed_superuser_with_search_path(&self, name: &str, schema: &str) {
        self.with(|s| s.committed.add_role(name, Some(schema), true));
    }

    /// The next statement containing `fragment` fails; later ones succeed.
    pub(crate) fn fail_on(&self, fragment: &str) {
        self.with(|s| s.failures.push(fragment.to_string()));
    }

    /// Another session commits the next statement containing `fragment`
    /// just before this one runs it, so the statement loses the race.
    pub(crate) fn created_concurrently(&self, fragment: &str) {
        self.with(|s| s.races.push(fragment.to_string()));
    }

    /// The `n`th commit attempt (1-based) fails and discards its changes.
    pub(crate) fn fail_commit_number(&self, n: usize) {
        self.with(|s| s.failing_commit = Some(n));
    }

    pub(crate) fn fail_rollbacks(&self) {
        self.with(|s| s.fail_rollbacks = true);
    }

    pub(crate) fn fail_connections(&self) {
        self.with(|s| s.fail_connections = true);
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.with(|s| s.statements.clone())
    }

    pub(crate) fn opened_databases(&self) -> Vec<String> {
        self.with(|s| s.opened.clone())
    }

    pub(crate) fn commits(&self) -> usize {
        self.with(|s| s.commits)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.with(|s| s.rollbacks)
    }

    pub(crate) fn has_schema(&self, name: &str) -> bool {
        self.with(|s| s.committed.schemas.contains_key(name))
    }

    pub(crate) fn has_role(&self, name: &str) -> bool {
        self.with(|s| s.committed.roles.contains_key(name))
    }

    /// Schemas `name` holds granted privileges on.
    pub(crate) fn role_privileges(&self, name: &str) -> Vec<String> {
        self.with(|s| {
            s.committed
                .roles
                .get(name)
                .map(|r| r.privileges.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub(crate) fn role_search_path(&self, name: &str) -> Option<String> {
        self.with(|s| {
            s.committed
                .roles
                .get(name)
                .and_then(|r| r.search_path.clone())
        })
    }

    /// A transaction acting as the bootstrap superuser.
    pub(crate) fn begin_fake(&self) -> Box<dyn Transaction> {
        Box::new(self.transaction(SESSION_USER))
    }

    fn transaction(&self, session_user: &str) -> FakeTransaction {
        let catalog = self.with(|s| s.committed.clone());
        FakeTransaction {
            db: self.clone(),
            session_user: session_user.to_string(),
            state: Mutex::new(TxState {
                catalog,
                aborted: false,
            }),
        }
    }

    /// Records `sql` and reports whether an injected failure claims it.
    /// A pending race on `sql` is committed by the other session here.
    fn record(&self, sql: &str) -> (bool, bool) {
        self.with(|s| {
            s.statements.push(sql.to_string());
            let raced = match s.races.iter().position(|f| sql.contains(f.as_str())) {
                Some(index) => {
                    s.races.remove(index);
                    let databases = s.databases.clone();
                    apply(&mut s.committed, SESSION_USER, &databases, sql, &[]).is_ok()
                }
                None => false,
            };
            let injected = match s.failures.iter().position(|f| sql.contains(f.as_str())) {
                Some(index) => {
                    s.failures.remove(index);
                    true
                }
                None => false,
            };
            (injected, raced)
        })
    }
}

#[async_trait]
impl ConnectionProvisioner for FakeDatabase {
    async fn begin(
        &self,
        _ctx: &RequestContext,
        database: &str,
        admin: &Credentials,
    ) -> Result<Box<dyn Transaction>> {
        let refused = self.with(|s| {
            s.opened.push(database.to_string());
            s.fail_connections
        });
        if refused {
            return Err(GatewayError::ConnectionFailed {
                database: database.to_string(),
                cause: "connection refused".to_string(),
            });
        }
        Ok(Box::new(self.transaction(admin.username())))
    }
}

struct TxState {
    catalog: Catalog,
    aborted: bool,
}

pub(crate) struct FakeTransaction {
    db: FakeDatabase,
    session_user: String,
    state: Mutex<TxState>,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<QueryOutcome> {
        let (injected, raced) = self.db.record(sql);
        let databases = self.db.with(|s| s.databases.clone());
        let winner = if raced {
            Some(self.db.with(|s| s.committed.clone()))
        } else {
            None
        };

        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(pg_error(
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        if injected {
            state.aborted = true;
            return Err(pg_error(format!("injected failure: {}", sql)));
        }
        if let Some(committed) = winner {
            // The unique index sees the other session's row
            for (name, schema) in committed.schemas {
                state.catalog.schemas.entry(name).or_insert(schema);
            }
            for (name, role) in committed.roles {
                state.catalog.roles.entry(name).or_insert(role);
            }
        }

        let applied = apply(&mut state.catalog, &self.session_user, &databases, sql, params);
        if applied.is_err() {
            state.aborted = true;
        }
        applied
    }

    async fn commit(&mut self) -> Result<()> {
        let (catalog, aborted) = {
            let state = self.state.lock().unwrap();
            (state.catalog.clone(), state.aborted)
        };
        self.db.with(|s| {
            s.commit_attempts += 1;
            if aborted {
                return Err(pg_error("cannot commit an aborted transaction"));
            }
            if s.failing_commit == Some(s.commit_attempts) {
                return Err(pg_error("injected commit failure"));
            }
            s.committed = catalog;
            s.commits += 1;
            Ok(())
        })
    }

    async fn rollback(&mut self) -> Result<()> {
        self.db.with(|s| {
            s.rollbacks += 1;
            if s.fail_rollbacks {
                Err(pg_error("injected rollback failure"))
            } else {
                Ok(())
            }
        })
    }
}

fn pg_error(message: impl Into<String>) -> GatewayError {
    GatewayError::Unexpected(message.into())
}

fn duplicate(code: &SqlState, message: String) -> GatewayError {
    GatewayError::from_db_error(code, &message)
}

fn is_tenant_schema(name: &str) -> bool {
    !name.starts_with("pg_") && name != "information_schema" && name != "public"
}

fn row(columns: &[(&str, Option<String>)]) -> SqlRow {
    SqlRow::new(
        columns
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    )
}

fn rows(rows: Vec<SqlRow>) -> QueryOutcome {
    QueryOutcome {
        affected: rows.len() as u64,
        rows,
    }
}

fn done() -> QueryOutcome {
    QueryOutcome::default()
}

fn captures(pattern: &str, sql: &str) -> Option<Vec<String>> {
    let re = Regex::new(pattern).unwrap();
    re.captures(sql).map(|caps| {
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect()
    })
}

fn param(params: &[&str]) -> Result<String> {
    params
        .first()
        .map(|p| p.to_string())
        .ok_or_else(|| pg_error("bind message supplies 0 parameters"))
}

fn apply(
    catalog: &mut Catalog,
    session_user: &str,
    databases: &[String],
    sql: &str,
    params: &[&str],
) -> Result<QueryOutcome> {
    if sql.starts_with("SELECT") {
        return select(catalog, databases, sql, params);
    }

    if let Some(c) = captures(r"^CREATE SCHEMA (\w+)$", sql) {
        if catalog.schemas.contains_key(&c[0]) {
            return Err(duplicate(
                &SqlState::DUPLICATE_SCHEMA,
                format!("schema \"{}\" already exists", c[0]),
            ));
        }
        catalog.schemas.insert(
            c[0].clone(),
            FakeSchema {
                owner: session_user.to_string(),
                acl: Vec::new(),
            },
        );
        return Ok(done());
    }

    if let Some(c) = captures(r"^DROP SCHEMA (\w+)$", sql) {
        catalog.require_schema(&c[0])?;
        catalog.schemas.remove(&c[0]);
        for role in catalog.roles.values_mut() {
            role.privileges.remove(&c[0]);
        }
        return Ok(done());
    }

    if let Some(c) = captures(r"^CREATE USER (\w+) WITH PASSWORD '([^']*)'$", sql) {
        if catalog.roles.contains_key(&c[0]) {
            return Err(duplicate(
                &SqlState::DUPLICATE_OBJECT,
                format!("role \"{}\" already exists", c[0]),
            ));
        }
        catalog.add_role(&c[0], None, false);
        return Ok(done());
    }

    if let Some(c) = captures(r"^DROP ROLE (\w+)$", sql) {
        catalog.require_role(&c[0])?;
        let granted = catalog
            .roles
            .get(&c[0])
            .map(|r| !r.privileges.is_empty())
            .unwrap_or(false);
        if granted || catalog.schemas.values().any(|s| s.owner == c[0]) {
            return Err(pg_error(format!(
                "role \"{}\" cannot be dropped because some objects depend on it",
                c[0]
            )));
        }
        catalog.roles.remove(&c[0]);
        for role in catalog.roles.values_mut() {
            role.members.remove(&c[0]);
        }
        return Ok(done());
    }

    if let Some(c) = captures(r"^REASSIGN OWNED BY (\w+) TO (\w+)$", sql) {
        catalog.require_role(&c[0])?;
        catalog.require_role(&c[1])?;
        for schema in catalog.schemas.values_mut() {
            if schema.owner == c[0] {
                schema.owner = c[1].clone();
            }
        }
        return Ok(done());
    }

    if let Some(c) = captures(r"^DROP OWNED BY (\w+)$", sql) {
        catalog.require_role(&c[0])?;
        catalog.schemas.retain(|_, schema| schema.owner != c[0]);
        let grantee = format!("{}=", c[0]);
        for schema in catalog.schemas.values_mut() {
            schema.acl.retain(|entry| !entry.starts_with(&grantee));
        }
        if let Some(role) = catalog.roles.get_mut(&c[0]) {
            role.privileges.clear();
        }
        return Ok(done());
    }

    if let Some(c) = captures(r"^ALTER ROLE (\w+) SET search_path TO (\w+)$", sql) {
        let role = catalog
            .roles
            .get_mut(&c[0])
            .ok_or_else(|| pg_error(format!("role \"{}\" does not exist", c[0])))?;
        role.search_path = Some(c[1].clone());
        return Ok(done());
    }

    if let Some(c) = captures(r"^ALTER SCHEMA (\w+) OWNER TO (\w+)$", sql) {
        catalog.require_role(&c[1])?;
        let schema = catalog
            .schemas
            .get_mut(&c[0])
            .ok_or_else(|| pg_error(format!("schema \"{}\" does not exist", c[0])))?;
        schema.owner = c[1].clone();
        return Ok(done());
    }

    if let Some(c) = captures(r"^GRANT USAGE ON SCHEMA (\w+) TO (\w+)$", sql) {
        catalog.require_role(&c[1])?;
        let schema = catalog
            .schemas
            .get_mut(&c[0])
            .ok_or_else(|| pg_error(format!("schema \"{}\" does not exist", c[0])))?;
        if schema.acl.is_empty() {
            schema.acl.push(format!("{0}=UC/{0}", schema.owner));
        }
        let entry = format!("{}=U/{}", c[1], schema.owner);
        if !schema.acl.contains(&entry) {
            schema.acl.push(entry);
        }
        grant_privilege(catalog, &c[1], &c[0]);
        return Ok(done());
    }

    if let Some(c) = captures(r"^GRANT [A-Z, ]+ ON (?:ALL \w+ IN )?SCHEMA (\w+) TO (\w+)$", sql) {
        catalog.require_schema(&c[0])?;
        catalog.require_role(&c[1])?;
        grant_privilege(catalog, &c[1], &c[0]);
        return Ok(done());
    }

    if let Some(c) = captures(r"^GRANT (\w+) TO (\w+)$", sql) {
        catalog.require_role(&c[1])?;
        let role = catalog
            .roles
            .get_mut(&c[0])
            .ok_or_else(|| pg_error(format!("role \"{}\" does not exist", c[0])))?;
        role.members.insert(c[1].clone());
        return Ok(done());
    }

    Err(pg_error(format!("fake catalog cannot execute: {}", sql)))
}

fn grant_privilege(catalog: &mut Catalog, role: &str, schema: &str) {
    if let Some(role) = catalog.roles.get_mut(role) {
        role.privileges.insert(schema.to_string());
    }
}

fn select(
    catalog: &Catalog,
    databases: &[String],
    sql: &str,
    params: &[&str],
) -> Result<QueryOutcome> {
    if sql.contains("FROM pg_catalog.pg_database") {
        let mut names = databases.to_vec();
        names.sort();
        return Ok(rows(
            names
                .into_iter()
                .map(|name| row(&[("datname", Some(name))]))
                .collect(),
        ));
    }

    if sql.contains("FROM pg_catalog.pg_namespace") {
        if sql.contains("owner_username") {
            let name = param(params)?;
            return Ok(rows(
                catalog
                    .schemas
                    .get(&name)
                    .filter(|_| is_tenant_schema(&name))
                    .map(|schema| {
                        let acl = if schema.acl.is_empty() {
                            None
                        } else {
                            Some(format!("{{{}}}", schema.acl.join(",")))
                        };
                        row(&[
                            ("schema_name", Some(name.clone())),
                            ("owner_username", Some(schema.owner.clone())),
                            ("schema_acl", acl),
                        ])
                    })
                    .into_iter()
                    .collect(),
            ));
        }

        let wanted = params.first().map(|p| p.to_string());
        return Ok(rows(
            catalog
                .schemas
                .keys()
                .filter(|name| is_tenant_schema(name))
                .filter(|name| wanted.as_ref().map_or(true, |w| w == *name))
                .map(|name| row(&[("schema_name", Some(name.clone()))]))
                .collect(),
        ));
    }

    if sql.contains("FROM pg_catalog.pg_roles") {
        let name = param(params)?;
        return Ok(rows(
            catalog
                .roles
                .get_key_value(&name)
                .map(|(name, _)| row(&[("username", Some(name.clone()))]))
                .into_iter()
                .collect(),
        ));
    }

    if sql.contains("FROM pg_catalog.pg_user") {
        let setting = param(params)?;
        return Ok(rows(
            catalog
                .roles
                .iter()
                .filter(|(_, role)| !role.superuser)
                .filter(|(_, role)| {
                    role.search_path
                        .as_ref()
                        .is_some_and(|path| format!("search_path={}", path) == setting)
                })
                .map(|(name, role)| {
                    row(&[
                        ("id", Some(role.oid.to_string())),
                        ("username", Some(name.clone())),
                    ])
                })
                .collect(),
        ));
    }

    Err(pg_error(format!("fake catalog cannot answer: {}", sql)))
}

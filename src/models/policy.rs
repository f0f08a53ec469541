//! Bucket policy document, as stored on the object backend.
//!
//! Only two statements are managed by the service, both identified by `Sid`:
//!
//! - `PublicRead`: allows anonymous `s3:GetObject` on every listed object ARN.
//! - `DenyAllExceptOwner`: denies anonymous `s3:GetObject` on every listed ARN.
//!
//! Any other statement (and any other top-level field) is carried through
//! edits verbatim, in its original slot.

use super::file_item::Permission;
use serde_json::{Map, Value, json};

pub const POLICY_VERSION: &str = "2012-10-17";
pub const PUBLIC_READ_SID: &str = "PublicRead";
pub const DENY_ALL_SID: &str = "DenyAllExceptOwner";

const GET_OBJECT_ACTION: &str = "s3:GetObject";

/// Canonical ARN naming one object inside a bucket policy.
pub fn object_arn(bucket: &str, key: &str) -> String {
    format!("arn:aws:s3:::{}/{}", bucket, key)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    PublicRead(Vec<String>),
    DenyAll(Vec<String>),
    Other(Value),
}

impl Statement {
    fn managed(permission: Permission, resources: Vec<String>) -> Self {
        match permission {
            Permission::Public => Statement::PublicRead(resources),
            Permission::Private => Statement::DenyAll(resources),
        }
    }

    fn from_value(value: Value) -> Self {
        match value.get("Sid").and_then(Value::as_str) {
            Some(PUBLIC_READ_SID) => Statement::PublicRead(resources_of(&value)),
            Some(DENY_ALL_SID) => Statement::DenyAll(resources_of(&value)),
            _ => Statement::Other(value),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Statement::PublicRead(resources) => managed_value(PUBLIC_READ_SID, "Allow", resources),
            Statement::DenyAll(resources) => managed_value(DENY_ALL_SID, "Deny", resources),
            Statement::Other(raw) => raw.clone(),
        }
    }

    fn permission(&self) -> Option<Permission> {
        match self {
            Statement::PublicRead(_) => Some(Permission::Public),
            Statement::DenyAll(_) => Some(Permission::Private),
            Statement::Other(_) => None,
        }
    }

    fn resources(&self) -> Option<&Vec<String>> {
        match self {
            Statement::PublicRead(resources) | Statement::DenyAll(resources) => Some(resources),
            Statement::Other(_) => None,
        }
    }

    fn resources_mut(&mut self) -> Option<&mut Vec<String>> {
        match self {
            Statement::PublicRead(resources) | Statement::DenyAll(resources) => Some(resources),
            Statement::Other(_) => None,
        }
    }
}

fn managed_value(sid: &str, effect: &str, resources: &[String]) -> Value {
    json!({
        "Sid": sid,
        "Effect": effect,
        "Principal": { "AWS": ["*"] },
        "Action": [GET_OBJECT_ACTION],
        "Resource": resources,
    })
}

/// `Resource` may be a single string or a list of strings.
fn resources_of(value: &Value) -> Vec<String> {
    match value.get("Resource") {
        Some(Value::String(resource)) => vec![resource.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Keep exactly one occurrence of `arn`, appending it when missing.
fn keep_once(resources: &mut Vec<String>, arn: &str) {
    let mut seen = false;
    resources.retain(|resource| {
        if resource != arn {
            return true;
        }
        let first = !seen;
        seen = true;
        first
    });
    if !seen {
        resources.push(arn.to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketPolicy {
    version: String,
    statements: Vec<Statement>,
    /// Top-level fields other than `Version` and `Statement` (e.g. `Id`).
    extra: Map<String, Value>,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statements: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl BucketPolicy {
    /// Parse a stored document. A missing or blank document is an empty policy.
    pub fn parse(document: Option<&str>) -> serde_json::Result<Self> {
        let Some(document) = document.filter(|doc| !doc.trim().is_empty()) else {
            return Ok(Self::default());
        };

        let mut root: Map<String, Value> = serde_json::from_str(document)?;
        let version = match root.remove("Version") {
            Some(Value::String(version)) => version,
            _ => POLICY_VERSION.to_string(),
        };
        let statements = match root.remove("Statement") {
            Some(Value::Array(items)) => items.into_iter().map(Statement::from_value).collect(),
            Some(single @ Value::Object(_)) => vec![Statement::from_value(single)],
            _ => Vec::new(),
        };

        Ok(Self {
            version,
            statements,
            extra: root,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut root = self.extra.clone();
        root.insert("Version".into(), Value::String(self.version.clone()));
        root.insert(
            "Statement".into(),
            Value::Array(self.statements.iter().map(Statement::to_value).collect()),
        );
        serde_json::to_string(&Value::Object(root))
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Place `arn` in the statement matching `permission` and take it out of the other one.
    pub fn grant(&mut self, arn: &str, permission: Permission) {
        let mut granted = false;
        for statement in &mut self.statements {
            let kind = statement.permission();
            let Some(resources) = statement.resources_mut() else {
                continue;
            };
            if kind == Some(permission) && !granted {
                keep_once(resources, arn);
                granted = true;
            } else {
                resources.retain(|resource| resource != arn);
            }
        }
        if !granted {
            self.statements
                .push(Statement::managed(permission, vec![arn.to_string()]));
        }
        self.prune_empty();
    }

    /// Take `arn` out of both managed statements.
    pub fn revoke(&mut self, arn: &str) {
        for statement in &mut self.statements {
            if let Some(resources) = statement.resources_mut() {
                resources.retain(|resource| resource != arn);
            }
        }
        self.prune_empty();
    }

    /// The managed statement currently listing `arn`, if any.
    pub fn permission_of(&self, arn: &str) -> Option<Permission> {
        self.statements.iter().find_map(|statement| {
            statement
                .resources()
                .filter(|resources| resources.iter().any(|resource| resource == arn))
                .and(statement.permission())
        })
    }

    /// Every ARN listed under the statement for `permission`.
    pub fn resources(&self, permission: Permission) -> Vec<&str> {
        self.statements
            .iter()
            .filter(|statement| statement.permission() == Some(permission))
            .filter_map(Statement::resources)
            .flatten()
            .map(String::as_str)
            .collect()
    }

    fn prune_empty(&mut self) {
        self.statements.retain(|statement| {
            statement
                .resources()
                .is_none_or(|resources| !resources.is_empty())
        });
    }
}

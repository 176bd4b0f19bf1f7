//! Deployment-name grammar, network segment index pool and task-id grammar.
//!
//! Deployment names look like `<prefix>[_<subnet>]-<index>-<instance guid>` with the
//! index left-padded to four digits. Task ids handed out by the director client are
//! prefixed with the deployment name: `<deployment>_<numeric id>`.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FabrikError, FabrikResult};

pub const DEFAULT_PREFIX: &str = "service-fabrik";

/// Left-pad an index to at least four digits.
pub fn adjust_index(index: u32) -> String { format!("{:04}", index) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentName {
    pub prefix: String,
    pub subnet: Option<String>,
    pub index: u32,
    pub guid: String,
}

impl DeploymentName {
    pub fn new(prefix: &str, subnet: Option<&str>, index: u32, guid: &str) -> Self {
        Self { prefix: prefix.to_string(), subnet: subnet.map(str::to_string), index, guid: guid.to_string() }
    }

    pub fn render(&self) -> String {
        match &self.subnet {
            Some(s) => format!("{}_{}-{}-{}", self.prefix, s, adjust_index(self.index), self.guid),
            None => format!("{}-{}-{}", self.prefix, adjust_index(self.index), self.guid),
        }
    }
}

impl std::fmt::Display for DeploymentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.render()) }
}

/// Parser for deployment names belonging to one `(prefix, subnet)` pair.
#[derive(Debug, Clone)]
pub struct NameGrammar {
    prefix: String,
    subnet: Option<String>,
    re: Regex,
}

impl NameGrammar {
    pub fn new(prefix: &str, subnet: Option<&str>) -> FabrikResult<Self> {
        let head = match subnet {
            Some(s) => format!("{}_{}", regex::escape(prefix), regex::escape(s)),
            None => regex::escape(prefix),
        };
        let re = Regex::new(&format!("^({})-([0-9]{{4,}})-([0-9a-z-]+)$", head))
            .map_err(|e| FabrikError::InternalServerError(format!("deployment name pattern: {}", e)))?;
        Ok(Self { prefix: prefix.to_string(), subnet: subnet.map(str::to_string), re })
    }

    pub fn format(&self, index: u32, guid: &str) -> String {
        DeploymentName::new(&self.prefix, self.subnet.as_deref(), index, guid).render()
    }

    /// Parse a name of this grammar; names of other prefixes/subnets yield `None`.
    pub fn parse(&self, name: &str) -> Option<DeploymentName> {
        let caps = self.re.captures(name)?;
        let index = caps.get(2)?.as_str().parse().ok()?;
        Some(DeploymentName { prefix: self.prefix.clone(), subnet: self.subnet.clone(), index, guid: caps.get(3)?.as_str().to_string() })
    }

    pub fn index_of(&self, name: &str) -> FabrikResult<u32> {
        self.parse(name)
            .map(|d| d.index)
            .ok_or_else(|| FabrikError::UnprocessableEntity(format!("deployment name '{}' does not match the naming scheme", name)))
    }
}

/// Bounded pool of `capacity` network segment indices starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPool {
    pub offset: u32,
    pub capacity: u32,
}

impl IndexPool {
    pub fn new(offset: u32, capacity: u32) -> Self { Self { offset, capacity } }

    pub fn used_indices<'a>(grammar: &NameGrammar, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<u32> {
        names.into_iter().filter_map(|n| grammar.parse(n)).map(|d| d.index).collect()
    }

    /// Lowest index not implied by any of `names`.
    pub fn find_free<'a>(&self, grammar: &NameGrammar, names: impl IntoIterator<Item = &'a str>) -> FabrikResult<u32> {
        let used = Self::used_indices(grammar, names);
        (self.offset..self.offset.saturating_add(self.capacity))
            .find(|i| !used.contains(i))
            .ok_or_else(|| FabrikError::UnprocessableEntity(format!("no free network segment index left (capacity {} from {})", self.capacity, self.offset)))
    }
}

impl Default for IndexPool {
    fn default() -> Self { Self { offset: 0, capacity: 1235 } }
}

/// `<deployment>_<id>`
pub fn prefix_task_id(deployment: &str, task_id: u64) -> String { format!("{}_{}", deployment, task_id) }

/// Split a prefixed task id into `(deployment, numeric id)`; bare numeric ids yield no deployment.
pub fn parse_task_id(task_id: &str) -> FabrikResult<(Option<&str>, u64)> {
    let bad = || FabrikError::BadRequest(format!("invalid task id '{}'", task_id));
    match task_id.rsplit_once('_') {
        Some((deployment, id)) if !deployment.is_empty() => Ok((Some(deployment), id.parse().map_err(|_| bad())?)),
        _ => Ok((None, task_id.parse().map_err(|_| bad())?)),
    }
}

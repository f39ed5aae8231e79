// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! Registry of the relational schemas queries can target.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub keywords: Vec<String>,
    /// Markdown description of the schema, fed into the generation prompt.
    pub schema_doc_path: PathBuf,
    /// Metadata graph loaded by the query-DSL runtime.
    pub metadata_path: PathBuf,
    pub database_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_hints: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainRegistry {
    domains: Vec<Domain>,
    default_domain: String,
}

/// On-disk registry layout.
#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default = "default_domain_name")]
    default_domain: String,
    domains: Vec<Domain>,
}

fn default_domain_name() -> String {
    "Broker".to_string()
}

const TPCH_HINTS: &str = "\
# Known Collections in TPCH (with example properties):
#   orders (key, customer_key, order_status, total_price, order_date, lines: [line])
#   lines (order_key, part_key, supplier_key, line_number, quantity, extended_price, discount, tax)
#   suppliers (key, name, nation_key, account_balance)
#   customers (key, name, nation_key, account_balance, market_segment)
#   nations (key, name, region_key)
#   regions (key, name)
#   parts (key, name, manufacturer, brand, type, size, retail_price)
#   supply_records (part_key, supplier_key, available_quantity, supply_cost)";

const BROKER_HINTS: &str = "\
# Known Collections in Broker (with example properties):
#   customer (customer_id, name, email)
#   transaction (transaction_id, customer_id, ticker, type, shares, price_per_share, timestamp)
#   stock (ticker, company_name, sector)
#   price (ticker, timestamp, price)";

impl Domain {
    /// Domain laid out under `data_dir` as `<lower>.md`, `<lower>.json` and `<db_stem>.db`.
    fn shipped(data_dir: &Path, name: &str, db_stem: &str, keywords: &[&str]) -> Self {
        let lower = name.to_lowercase();
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            schema_doc_path: data_dir.join(format!("{lower}.md")),
            metadata_path: data_dir.join(format!("{lower}.json")),
            database_path: data_dir.join(format!("{db_stem}.db")),
            collection_hints: None,
        }
    }

    fn with_hints(mut self, hints: &str) -> Self {
        self.collection_hints = Some(hints.to_string());
        self
    }
}

impl DomainRegistry {
    /// Validates names are unique and the default is registered.
    pub fn new(domains: Vec<Domain>, default_domain: impl Into<String>) -> PipelineResult<Self> {
        let default_domain = default_domain.into();
        if domains.is_empty() {
            return Err(PipelineError::Configuration(
                "domain registry must contain at least one domain".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for domain in &domains {
            if !seen.insert(domain.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate domain '{}'",
                    domain.name
                )));
            }
        }
        if !seen.contains(default_domain.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "default domain '{default_domain}' is not registered"
            )));
        }

        Ok(Self {
            domains,
            default_domain,
        })
    }

    /// The seven shipped schemas, with `Broker` as default.
    pub fn builtin(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        let domains = vec![
            Domain::shipped(
                dir,
                "Broker",
                "Broker",
                &[
                    "customer", "ticker", "transaction", "stock", "price", "share", "trade",
                    "broker", "exchange",
                ],
            )
            .with_hints(BROKER_HINTS),
            Domain::shipped(
                dir,
                "Dealership",
                "Dealership",
                &[
                    "car", "make", "model", "salesperson", "customer", "sale", "dealership",
                    "inventory", "vehicle", "vin",
                ],
            ),
            Domain::shipped(
                dir,
                "DermTreatment",
                "DermTreatment",
                &[
                    "doctor", "patient", "drug", "treatment", "diagnosis", "dermatology",
                    "medical", "clinic", "adverse", "derm",
                ],
            ),
            Domain::shipped(
                dir,
                "Ewallet",
                "Ewallet",
                &[
                    "user", "transaction", "merchant", "wallet", "balance", "payment", "coupon",
                    "ewallet", "digital", "finance",
                ],
            ),
            Domain::shipped(
                dir,
                "TPCH",
                "tpch",
                &[
                    "supplier", "order", "lineitem", "customer", "nation", "region", "part",
                    "partsupp", "tpch",
                ],
            )
            .with_hints(TPCH_HINTS),
            Domain::shipped(
                dir,
                "DepMap",
                "DepMap",
                &[
                    "gene", "dependency", "expression", "mutation", "cell line", "cancer",
                    "depmap",
                ],
            ),
            Domain::shipped(
                dir,
                "ProteinNetwork",
                "ProteinNetwork",
                &[
                    "protein", "interaction", "network", "link", "score", "edge", "node",
                ],
            ),
        ];

        Self {
            domains,
            default_domain: "Broker".to_string(),
        }
    }

    pub fn from_yaml_str(raw: &str) -> PipelineResult<Self> {
        let parsed: RegistryFile = serde_yaml::from_str(raw)?;
        Self::new(parsed.domains, parsed.default_domain)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Exact match first, then case-insensitive.
    pub fn resolve(&self, name: &str) -> Option<&Domain> {
        let trimmed = name.trim();
        self.get(trimmed).or_else(|| {
            self.domains
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(trimmed))
        })
    }

    pub fn require(&self, name: &str) -> PipelineResult<&Domain> {
        self.get(name).ok_or_else(|| PipelineError::UnknownDomain {
            requested: name.to_string(),
            known: self.names(),
        })
    }

    pub fn default_domain(&self) -> &Domain {
        // The constructors guarantee the default is registered.
        self.get(&self.default_domain).unwrap_or(&self.domains[0])
    }
}

/// Schema documentation for `domain`, or an empty string when the file is absent.
pub fn read_schema_doc(domain: &Domain) -> String {
    match std::fs::read_to_string(&domain.schema_doc_path) {
        Ok(content) => content,
        Err(e) => {
            if domain.schema_doc_path.exists() {
                warn!(domain = %domain.name, path = %domain.schema_doc_path.display(), error = %e, "Failed to read schema documentation");
            } else {
                debug!(domain = %domain.name, path = %domain.schema_doc_path.display(), "No schema documentation for domain");
            }
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_order_and_default() {
        let registry = DomainRegistry::builtin("data");
        assert_eq!(
            registry.names(),
            vec![
                "Broker",
                "Dealership",
                "DermTreatment",
                "Ewallet",
                "TPCH",
                "DepMap",
                "ProteinNetwork"
            ]
        );
        assert_eq!(registry.default_domain().name, "Broker");
    }

    #[test]
    fn test_builtin_paths_follow_data_layout() {
        let registry = DomainRegistry::builtin("data");
        let tpch = registry.get("TPCH").unwrap();
        assert_eq!(tpch.metadata_path, PathBuf::from("data/tpch.json"));
        assert_eq!(tpch.database_path, PathBuf::from("data/tpch.db"));
        assert_eq!(tpch.schema_doc_path, PathBuf::from("data/tpch.md"));
        assert!(tpch.collection_hints.is_some());
        let broker = registry.get("Broker").unwrap();
        assert_eq!(broker.database_path, PathBuf::from("data/Broker.db"));
        assert!(registry.get("Ewallet").unwrap().collection_hints.is_none());
    }

    #[test]
    fn test_resolve_is_case_insensitive_but_get_is_exact() {
        let registry = DomainRegistry::builtin("data");
        assert!(registry.get("tpch").is_none());
        assert_eq!(registry.resolve(" tpch ").unwrap().name, "TPCH");
        assert!(registry.resolve("Retail").is_none());
    }

    #[test]
    fn test_require_unknown_lists_known_domains() {
        let registry = DomainRegistry::builtin("data");
        let err = registry.require("Retail").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Retail"));
        assert!(message.contains("Broker"));
    }

    #[test]
    fn test_yaml_registry_rejects_duplicates() {
        let raw = r#"
default_domain: Shop
domains:
  - name: Shop
    keywords: [order]
    schema_doc_path: shop.md
    metadata_path: shop_graph.json
    database_path: shop.db
  - name: Shop
    keywords: [item]
    schema_doc_path: shop.md
    metadata_path: shop_graph.json
    database_path: shop.db
"#;
        assert!(matches!(
            DomainRegistry::from_yaml_str(raw),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_yaml_registry_requires_registered_default() {
        let raw = r#"
default_domain: Missing
domains:
  - name: Shop
    keywords: [order]
    schema_doc_path: shop.md
    metadata_path: shop_graph.json
    database_path: shop.db
"#;
        let err = DomainRegistry::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_example_registry_file_loads() {
        let registry =
            DomainRegistry::from_yaml_str(include_str!("../../../config/domains.example.yaml"))
                .unwrap();
        assert_eq!(registry.names(), vec!["Broker", "TPCH"]);
        assert!(registry
            .get("Broker")
            .unwrap()
            .collection_hints
            .as_deref()
            .unwrap()
            .contains("stock (ticker"));
        assert!(registry.get("TPCH").unwrap().collection_hints.is_none());
    }

    #[test]
    fn test_missing_schema_doc_reads_as_empty() {
        let registry = DomainRegistry::builtin("/nonexistent");
        assert_eq!(read_schema_doc(registry.default_domain()), "");
    }
}

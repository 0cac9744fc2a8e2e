//! Static catalog of tool servers and per-tool schemas.
//!
//! Loaded once from declarative JSON and immutable afterwards; every lookup
//! path is safe for concurrent readers. The registry never rejects unknown
//! tools; resolution failures are the dispatcher's concern.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const EMBEDDED_CATALOG: &str = include_str!("../data/mcp_catalog.json");
const EMBEDDED_SCHEMAS: &str = include_str!("../data/tool_schemas.json");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub types: HashMap<String, String>,
    #[serde(default)]
    pub alias_for: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCatalogEntry {
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: u8,
    pub description: String,
    #[serde(default)]
    pub key_tools: Vec<String>,
    #[serde(default)]
    pub when_to_use: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_tier() -> u8 {
    4
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_servers: usize,
    pub total_tools: usize,
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate_pct: f64,
}

pub struct SchemaRegistry {
    catalog: HashMap<String, ServerCatalogEntry>,
    schemas: HashMap<String, ToolSchema>,
    server_cache: Mutex<HashMap<String, Option<String>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SchemaRegistry {
    pub fn from_json(catalog_json: &str, schemas_json: &str) -> Result<Self> {
        let catalog: HashMap<String, ServerCatalogEntry> =
            serde_json::from_str(catalog_json).context("Failed to parse server catalog")?;
        let schemas: HashMap<String, ToolSchema> =
            serde_json::from_str(schemas_json).context("Failed to parse tool schemas")?;
        tracing::info!(
            servers = catalog.len(),
            tools = schemas.len(),
            "Schema registry loaded"
        );
        Ok(Self {
            catalog,
            schemas,
            server_cache: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Registry from the embedded data files.
    pub fn embedded() -> Self {
        Self::from_json(EMBEDDED_CATALOG, EMBEDDED_SCHEMAS)
            .unwrap_or_else(|e| panic!("embedded registry data is invalid: {e}"))
    }

    /// Load from disk, falling back to the embedded data per file.
    pub fn load(catalog_path: &Path, schemas_path: &Path) -> Self {
        let catalog_json =
            std::fs::read_to_string(catalog_path).unwrap_or_else(|_| EMBEDDED_CATALOG.to_string());
        let schemas_json =
            std::fs::read_to_string(schemas_path).unwrap_or_else(|_| EMBEDDED_SCHEMAS.to_string());
        match Self::from_json(&catalog_json, &schemas_json) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(error = %e, "Registry files invalid, using embedded data");
                Self::embedded()
            }
        }
    }

    /// Schema for a tool, resolving aliases one hop.
    pub fn get_tool_schema(&self, tool_name: &str) -> Option<&ToolSchema> {
        let schema = self.schemas.get(tool_name)?;
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        match &schema.alias_for {
            Some(canonical) => self.schemas.get(canonical),
            None => Some(schema),
        }
    }

    /// Canonical name for a tool, following an alias one hop.
    pub fn canonical_name<'a>(&'a self, tool_name: &'a str) -> Option<&'a str> {
        let (key, schema) = self.schemas.get_key_value(tool_name)?;
        match &schema.alias_for {
            Some(canonical) => Some(canonical.as_str()),
            None => Some(key.as_str()),
        }
    }

    /// Server owning a tool. Cached, including negative results.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<String> {
        if let Ok(cache) = self.server_cache.lock() {
            if let Some(cached) = cache.get(tool_name) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.clone();
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let result = self.schemas.get(tool_name).and_then(|schema| {
            match &schema.alias_for {
                Some(canonical) => self
                    .schemas
                    .get(canonical)
                    .map(|s| s.server.clone())
                    .filter(|s| !s.is_empty()),
                None if !schema.server.is_empty() => Some(schema.server.clone()),
                None => None,
            }
        });

        if let Ok(mut cache) = self.server_cache.lock() {
            cache.insert(tool_name.to_string(), result.clone());
        }
        result
    }

    /// Check required params. Unknown tools pass through; the dispatcher
    /// decides what to do with them.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> (bool, Option<String>) {
        let Some(schema) = self.get_tool_schema(tool_name) else {
            return (true, None);
        };
        let missing: Vec<&str> = schema
            .required
            .iter()
            .filter(|r| !args.contains_key(r.as_str()) || args[r.as_str()].is_null())
            .map(|r| r.as_str())
            .collect();
        if missing.is_empty() {
            (true, None)
        } else {
            (
                false,
                Some(format!("Missing required arguments: {}", missing.join(", "))),
            )
        }
    }

    pub fn server_entry(&self, server: &str) -> Option<&ServerCatalogEntry> {
        self.catalog.get(server)
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.catalog.keys().map(|s| s.as_str()).collect()
    }

    /// All canonical tool names (aliases excluded).
    pub fn all_tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .schemas
            .iter()
            .filter(|(_, s)| s.alias_for.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn tool_names_for_server(&self, server: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .schemas
            .iter()
            .filter(|(_, s)| s.alias_for.is_none() && s.server == server)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Deterministic LLM-readable catalog grouped by tier.
    pub fn catalog_for_prompt(&self, include_key_tools: bool) -> String {
        let mut lines = vec!["AVAILABLE REALMS (Tool Servers):".to_string(), String::new()];

        let mut by_tier: Vec<(u8, Vec<&ServerCatalogEntry>)> = Vec::new();
        for tier in 1..=4u8 {
            let mut servers: Vec<&ServerCatalogEntry> =
                self.catalog.values().filter(|s| s.tier == tier).collect();
            servers.sort_by(|a, b| a.name.cmp(&b.name));
            if !servers.is_empty() {
                by_tier.push((tier, servers));
            }
        }

        for (tier, servers) in by_tier {
            let tier_name = match tier {
                1 => "TIER 1 - CORE",
                2 => "TIER 2 - HIGH PRIORITY",
                3 => "TIER 3 - OPTIONAL",
                _ => "TIER 4 - SPECIALIZED",
            };
            lines.push(format!("{tier_name}:"));
            for server in servers {
                lines.push(format!("- {}: {}", server.name, server.description));
                if include_key_tools && !server.key_tools.is_empty() {
                    let mut tools = server.key_tools[..server.key_tools.len().min(5)].join(", ");
                    if server.key_tools.len() > 5 {
                        tools.push_str(", ...");
                    }
                    lines.push(format!("  Key tools: {tools}"));
                }
            }
            lines.push(String::new());
        }

        lines.push("DEPRECATED (use macos-use instead):".to_string());
        lines.push("- fetch -> fetch_url".to_string());
        lines.push("- time -> get_time".to_string());
        lines.push("- git -> execute_command('git ...')".to_string());
        lines.push("- search -> duckduckgo-search web_search, never the browser".to_string());
        lines.push(String::new());
        lines.push(
            "CRITICAL: Do NOT invent high-level tools. Use only the real tools listed for these realms."
                .to_string(),
        );

        lines.join("\n")
    }

    pub fn stats(&self) -> RegistryStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RegistryStats {
            total_servers: self.catalog.len(),
            total_tools: self.schemas.len(),
            cache_size: self.server_cache.lock().map(|c| c.len()).unwrap_or(0),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate_pct: if total > 0 {
                (hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            },
        }
    }

    pub fn clear_caches(&self) {
        if let Ok(mut cache) = self.server_cache.lock() {
            cache.clear();
        }
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_data_loads() {
        let registry = SchemaRegistry::embedded();
        assert!(registry.stats().total_servers >= 10);
        assert!(registry.stats().total_tools >= 40);
    }

    #[test]
    fn test_alias_resolution_one_hop() {
        let registry = SchemaRegistry::embedded();
        let schema = registry.get_tool_schema("bash").unwrap();
        assert_eq!(schema.server, "macos-use");
        assert_eq!(schema.required, vec!["command"]);
        assert_eq!(registry.get_server_for_tool("bash").as_deref(), Some("macos-use"));
    }

    #[test]
    fn test_unknown_tool_returns_none() {
        let registry = SchemaRegistry::embedded();
        assert!(registry.get_tool_schema("quantum_flux").is_none());
        assert!(registry.get_server_for_tool("quantum_flux").is_none());
    }

    #[test]
    fn test_validate_missing_args() {
        let registry = SchemaRegistry::embedded();
        let args = serde_json::Map::new();
        let (ok, error) = registry.validate_tool_call("execute_command", &args);
        assert!(!ok);
        assert!(error.unwrap().contains("command"));

        // Unknown tools are never rejected here.
        let (ok, error) = registry.validate_tool_call("quantum_flux", &args);
        assert!(ok);
        assert!(error.is_none());
    }

    #[test]
    fn test_validate_arg_order_irrelevant() {
        let registry = SchemaRegistry::embedded();
        let a: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"source": "/a", "destination": "/b"}"#).unwrap();
        let b: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"destination": "/b", "source": "/a"}"#).unwrap();
        assert_eq!(
            registry.validate_tool_call("move_file", &a).0,
            registry.validate_tool_call("move_file", &b).0
        );
    }

    #[test]
    fn test_cache_hit_after_repeat() {
        let registry = SchemaRegistry::embedded();
        registry.clear_caches();
        let _ = registry.get_server_for_tool("read_file");
        let misses_before = registry.stats().cache_misses;
        let _ = registry.get_server_for_tool("read_file");
        let stats = registry.stats();
        assert_eq!(stats.cache_misses, misses_before);
        assert!(stats.cache_hits > 0);
    }

    #[test]
    fn test_server_consistency_after_alias_resolution() {
        let registry = SchemaRegistry::embedded();
        for name in registry.all_tool_names() {
            let via_cache = registry.get_server_for_tool(name);
            let via_schema = registry.get_tool_schema(name).map(|s| s.server.clone());
            assert_eq!(via_cache, via_schema, "tool {name}");
        }
    }

    #[test]
    fn test_catalog_prompt_is_deterministic() {
        let registry = SchemaRegistry::embedded();
        let a = registry.catalog_for_prompt(true);
        let b = registry.catalog_for_prompt(true);
        assert_eq!(a, b);
        assert!(a.contains("TIER 1 - CORE"));
        assert!(a.contains("Key tools:"));
        let no_tools = registry.catalog_for_prompt(false);
        assert!(!no_tools.contains("Key tools:"));
    }

    #[test]
    fn test_tool_names_for_server() {
        let registry = SchemaRegistry::embedded();
        let tools = registry.tool_names_for_server("filesystem");
        assert!(tools.contains(&"read_file"));
        assert!(tools.contains(&"write_file"));
        // Aliases never appear in per-server listings.
        assert!(!tools.contains(&"cat"));
    }
}

use std::collections::HashSet;

use thiserror::Error;

use corral_common::BenchmarkConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown benchmark '{0}'")]
    Unknown(String),
    #[error("benchmark '{0}' is defined more than once")]
    Duplicate(String),
    #[error("benchmark '{0}' has no binary_path")]
    MissingBinary(String),
    #[error("no benchmarks are configured")]
    Empty,
}

/// The configured benchmarks, in file order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    benchmarks: Vec<BenchmarkConfig>,
}

impl Catalog {
    pub fn new(benchmarks: Vec<BenchmarkConfig>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for b in &benchmarks {
            if !seen.insert(b.name.as_str()) {
                return Err(CatalogError::Duplicate(b.name.clone()));
            }
            if b.binary_path.trim().is_empty() {
                return Err(CatalogError::MissingBinary(b.name.clone()));
            }
        }
        Ok(Self { benchmarks })
    }

    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkConfig> {
        self.benchmarks.iter()
    }

    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&BenchmarkConfig> {
        self.benchmarks.iter().find(|b| b.name == name)
    }

    /// `all` or a single name. Overrides from the command line are applied to
    /// the returned copies only.
    pub fn select(
        &self,
        selector: &str,
        processes: Option<u32>,
        timeout_sec: Option<u64>,
    ) -> Result<Vec<BenchmarkConfig>, CatalogError> {
        let picked: Vec<BenchmarkConfig> = if selector == "all" {
            if self.benchmarks.is_empty() {
                return Err(CatalogError::Empty);
            }
            self.benchmarks.clone()
        } else {
            vec![self
                .get(selector)
                .cloned()
                .ok_or_else(|| CatalogError::Unknown(selector.to_string()))?]
        };
        Ok(picked
            .into_iter()
            .map(|mut b| {
                if let Some(n) = processes {
                    b.process_count = n;
                }
                if let Some(t) = timeout_sec {
                    b.timeout_sec = t;
                }
                b
            })
            .collect())
    }

    /// Distinct binaries, each synchronized once.
    pub fn binaries(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.benchmarks
            .iter()
            .filter(|b| seen.insert(b.binary_path.clone()))
            .map(|b| b.binary_path.clone())
            .collect()
    }
}

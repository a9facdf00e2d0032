use std::{collections::HashMap, sync::Arc};

use super::{Model, RelationKind};
use crate::error::Error;

/// All models known to the engine, keyed by table name. Built once at start-up.
#[derive(Debug, Default)]
pub struct Registry {
    models: HashMap<String, Arc<Model>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { models: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Model>, Error> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown model '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }
}

pub struct RegistryBuilder {
    models: Vec<Model>,
}

impl RegistryBuilder {
    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Check every declaration. Relation targets are only checked for
    /// existence here; the descriptors resolve them lazily on first use.
    pub fn build(self) -> Result<Arc<Registry>, Error> {
        let names: Vec<&str> = self.models.iter().map(|m| m.table_name.as_str()).collect();

        for (i, model) in self.models.iter().enumerate() {
            if names[..i].contains(&model.table_name.as_str()) {
                return Err(Error::validation(format!(
                    "model '{}' registered twice",
                    model.table_name
                )));
            }
            if model.primary_keys.is_empty() {
                return Err(Error::validation(format!(
                    "model '{}' has no primary key",
                    model.table_name
                )));
            }
            for (name, relation) in &model.relations {
                let Some(target) = self.models.iter().find(|m| m.table_name == relation.target)
                else {
                    return Err(Error::validation(format!(
                        "relation '{}.{}' targets unknown model '{}'",
                        model.table_name, name, relation.target
                    )));
                };
                let keyed_side = match relation.kind {
                    RelationKind::BelongsTo => target,
                    RelationKind::HasMany | RelationKind::HasOne => model,
                };
                if keyed_side.primary_keys.len() > 1 && relation.local_key.is_none() {
                    return Err(Error::validation(format!(
                        "relation '{}.{}' needs an explicit local key: '{}' has a composite primary key",
                        model.table_name, name, keyed_side.table_name
                    )));
                }
            }
            for (name, computed) in &model.computed {
                if model.fields.is_empty() {
                    continue;
                }
                if let Some(missing) = computed.depends_on.iter().find(|d| model.field(d).is_none()) {
                    return Err(Error::validation(format!(
                        "computed field '{}.{}' depends on undeclared field '{}'",
                        model.table_name, name, missing
                    )));
                }
            }
        }

        let models = self
            .models
            .into_iter()
            .map(|m| (m.table_name.clone(), Arc::new(m)))
            .collect();
        Ok(Arc::new(Registry { models }))
    }
}

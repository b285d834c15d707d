//! Server parameter store
//!
//! The [`ParameterStore`] is the single authority for global parameter values
//! between rounds. It optionally keeps per-client overlays for parameters
//! that stay local (normalization statistics and the like) and are never
//! averaged into the server tensors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::AggError;
use slimfed_model::{NamedParameters, SlimmableModel};

/// Serializable snapshot of the store, used for export/import.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    server: NamedParameters,
    local_keys: Vec<String>,
    locals: HashMap<String, NamedParameters>,
}

/// Canonical server-side parameters plus optional per-client local overlays.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    server: NamedParameters,
    local_keys: Vec<String>,
    locals: HashMap<String, NamedParameters>,
}

impl ParameterStore {
    /// Creates a store owning the given server parameters.
    pub fn new(server: NamedParameters) -> Self {
        Self {
            server,
            local_keys: Vec::new(),
            locals: HashMap::new(),
        }
    }

    /// Declares parameter names that stay client-local.
    pub fn with_local_keys(mut self, keys: Vec<String>) -> Self {
        self.local_keys = keys;
        self
    }

    /// Returns the server parameters.
    pub fn server(&self) -> &NamedParameters {
        &self.server
    }

    /// Returns the server parameters mutably.
    pub fn server_mut(&mut self) -> &mut NamedParameters {
        &mut self.server
    }

    /// Replaces the server parameters.
    pub fn set_server(&mut self, server: NamedParameters) {
        self.server = server;
    }

    /// Returns true if the named parameter is kept client-local.
    pub fn is_local(&self, name: &str) -> bool {
        self.local_keys.iter().any(|k| k == name)
    }

    /// Declared client-local parameter names.
    pub fn local_keys(&self) -> &[String] {
        &self.local_keys
    }

    /// Server parameters excluding client-local keys; this is the key set
    /// the accumulators aggregate over.
    pub fn shared_view(&self) -> NamedParameters {
        let mut shared = NamedParameters::new();
        for (name, param) in self.server.iter() {
            if !self.is_local(name) {
                shared.insert(name, param.clone());
            }
        }
        shared
    }

    /// Records a client's local-only parameters, filtered to the declared
    /// local key set.
    pub fn record_local(&mut self, client_id: &str, params: &NamedParameters) {
        if self.local_keys.is_empty() {
            return;
        }
        let overlay = params.filtered(&self.local_keys);
        if !overlay.is_empty() {
            debug!(client_id, keys = overlay.len(), "recorded local overlay");
            self.locals.insert(client_id.to_string(), overlay);
        }
    }

    /// Returns a client's local overlay, if any.
    pub fn local_overlay(&self, client_id: &str) -> Option<&NamedParameters> {
        self.locals.get(client_id)
    }

    /// Server parameters merged with a client's local overlay.
    pub fn merged_for(&self, client_id: &str) -> NamedParameters {
        let mut merged = self.server.clone();
        if let Some(overlay) = self.locals.get(client_id) {
            for (name, param) in overlay.iter() {
                merged.insert(name, param.clone());
            }
        }
        merged
    }

    /// Loads the server parameters (with the client's overlay applied) into a
    /// model at its current width.
    pub fn load_into(
        &self,
        model: &mut dyn SlimmableModel,
        client_id: &str,
        strict: bool,
    ) -> Result<(), AggError> {
        let merged = self.merged_for(client_id);
        model.set_named_parameters(&merged, strict)?;
        Ok(())
    }

    /// Serializes the full store state.
    pub fn export(&self) -> Result<Vec<u8>, AggError> {
        let state = StoreState {
            server: self.server.clone(),
            local_keys: self.local_keys.clone(),
            locals: self.locals.clone(),
        };
        serde_json::to_vec(&state).map_err(|e| AggError::Serialization(e.to_string()))
    }

    /// Restores a store from serialized bytes.
    pub fn import(data: &[u8]) -> Result<Self, AggError> {
        let state: StoreState =
            serde_json::from_slice(data).map_err(|e| AggError::Serialization(e.to_string()))?;
        Ok(Self {
            server: state.server,
            local_keys: state.local_keys,
            locals: state.locals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimfed_model::{Param, TensorData};

    fn create_test_server() -> NamedParameters {
        let mut params = NamedParameters::new();
        params.insert(
            "fc.weight",
            Param::averaged(TensorData::ones_f32(vec![4i64, 4])),
        );
        params.insert(
            "norm.running_mean",
            Param::averaged(TensorData::zeros_f32(vec![4i64])),
        );
        params
    }

    #[test]
    fn test_shared_view_excludes_local_keys() {
        let store = ParameterStore::new(create_test_server())
            .with_local_keys(vec!["norm.running_mean".to_string()]);

        let shared = store.shared_view();
        assert!(shared.contains_key("fc.weight"));
        assert!(!shared.contains_key("norm.running_mean"));
        assert!(store.is_local("norm.running_mean"));
    }

    #[test]
    fn test_record_and_merge_local_overlay() {
        let mut store = ParameterStore::new(create_test_server())
            .with_local_keys(vec!["norm.running_mean".to_string()]);

        let mut contribution = NamedParameters::new();
        contribution.insert(
            "norm.running_mean",
            Param::averaged(TensorData::float32(vec![9.0; 4], vec![4i64])),
        );
        contribution.insert(
            "fc.weight",
            Param::averaged(TensorData::zeros_f32(vec![4i64, 4])),
        );
        store.record_local("client-1", &contribution);

        // Only the declared local key is kept in the overlay.
        let overlay = store.local_overlay("client-1").unwrap();
        assert_eq!(overlay.len(), 1);

        // The merge overrides the local key but keeps the server weight.
        let merged = store.merged_for("client-1");
        assert_eq!(
            merged.get("norm.running_mean").unwrap().data.as_f32_slice().unwrap(),
            &[9.0; 4]
        );
        assert_eq!(
            merged.get("fc.weight").unwrap().data.as_f32_slice().unwrap(),
            &[1.0; 16]
        );

        // A client without an overlay sees plain server values.
        let merged = store.merged_for("client-2");
        assert_eq!(
            merged.get("norm.running_mean").unwrap().data.as_f32_slice().unwrap(),
            &[0.0; 4]
        );
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut store = ParameterStore::new(create_test_server())
            .with_local_keys(vec!["norm.running_mean".to_string()]);
        let mut contribution = NamedParameters::new();
        contribution.insert(
            "norm.running_mean",
            Param::averaged(TensorData::float32(vec![3.0; 4], vec![4i64])),
        );
        store.record_local("client-1", &contribution);

        let bytes = store.export().unwrap();
        let restored = ParameterStore::import(&bytes).unwrap();

        assert_eq!(restored.server(), store.server());
        assert!(restored.local_overlay("client-1").is_some());
        assert!(restored.is_local("norm.running_mean"));
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(matches!(
            ParameterStore::import(b"not json"),
            Err(AggError::Serialization(_))
        ));
    }
}

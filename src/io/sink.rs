use crate::types::{DerivedLayer, HarmonicError, HarmonicResult, SeriesLayer};
use std::collections::BTreeMap;

/// Receiver of output rasters (export, display, tests)
pub trait LayerSink {
    fn write_layer(&mut self, layer: &DerivedLayer) -> HarmonicResult<()>;

    /// Series layers default to `"<series>/<acquisition id>"` names
    fn write_series(&mut self, series: &str, entry: &SeriesLayer) -> HarmonicResult<()> {
        let named = entry
            .layer
            .clone()
            .renamed(format!("{}/{}", series, entry.acquisition_id));
        self.write_layer(&named)
    }
}

/// Collects layers in memory, keyed by name
#[derive(Debug, Default)]
pub struct MemorySink {
    layers: BTreeMap<String, DerivedLayer>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DerivedLayer> {
        self.layers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn into_layers(self) -> BTreeMap<String, DerivedLayer> {
        self.layers
    }
}

impl LayerSink for MemorySink {
    fn write_layer(&mut self, layer: &DerivedLayer) -> HarmonicResult<()> {
        if self.layers.contains_key(&layer.name) {
            return Err(HarmonicError::Processing(format!(
                "Layer '{}' written twice",
                layer.name
            )));
        }
        log::debug!("Sink received layer '{}' ({} valid pixels)", layer.name, layer.valid_count());
        self.layers.insert(layer.name.clone(), layer.clone());
        Ok(())
    }
}

// In-memory trading state shared by the engine loops

use std::collections::HashMap;

/// Cached ladders per pair and reserved inventory per base asset.
///
/// Written by the trading loop and the reload procedure only; the
/// telemetry loop takes read-only snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineState {
    ladders: HashMap<String, Vec<f64>>,
    reserved: HashMap<String, f64>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ladder(&self, pair: &str) -> Option<&[f64]> {
        self.ladders.get(pair).map(Vec::as_slice)
    }

    pub fn set_ladder(&mut self, pair: &str, levels: Vec<f64>) {
        self.ladders.insert(pair.to_string(), levels);
    }

    pub fn remove_ladder(&mut self, pair: &str) -> Option<Vec<f64>> {
        self.ladders.remove(pair)
    }

    pub fn ladders(&self) -> &HashMap<String, Vec<f64>> {
        &self.ladders
    }

    pub fn ladder_pairs(&self) -> impl Iterator<Item = &String> {
        self.ladders.keys()
    }

    /// Base quantity the grid must not sell
    pub fn reserved_for(&self, asset: &str) -> f64 {
        self.reserved.get(asset).copied().unwrap_or(0.0)
    }

    pub fn reserve(&mut self, asset: &str, quantity: f64) {
        if quantity > 0.0 {
            self.reserved.insert(asset.to_string(), quantity);
        } else {
            self.reserved.remove(asset);
        }
    }

    pub fn release(&mut self, asset: &str) -> Option<f64> {
        self.reserved.remove(asset)
    }

    pub fn reserved(&self) -> &HashMap<String, f64> {
        &self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.ladders.is_empty() && self.reserved.is_empty()
    }

    pub fn clear(&mut self) {
        self.ladders.clear();
        self.reserved.clear();
    }
}

use crate::Reconstruction;
use log::*;
use parking_lot::RwLock;
use std::sync::Arc;

/// A model that can be read by observers while the worker growing it holds it only briefly.
pub type SharedReconstruction = Arc<RwLock<Reconstruction>>;

/// The models of a run, in the order they were created.
///
/// Models never share images or tracks. The manager itself enforces nothing about them beyond
/// giving each its own slot.
#[derive(Debug, Default)]
pub struct ReconstructionManager {
    models: Vec<SharedReconstruction>,
}

impl ReconstructionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty model and return its index.
    pub fn add(&mut self) -> usize {
        self.insert(Reconstruction::new())
    }

    /// Add an existing model and return its index.
    pub fn insert(&mut self, reconstruction: Reconstruction) -> usize {
        self.push(reconstruction).0
    }

    /// Add an existing model and return its index along with its handle.
    pub fn push(&mut self, reconstruction: Reconstruction) -> (usize, SharedReconstruction) {
        let model = Arc::new(RwLock::new(reconstruction));
        self.models.push(model.clone());
        (self.models.len() - 1, model)
    }

    pub fn get(&self, index: usize) -> Option<SharedReconstruction> {
        self.models.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Remove a model. Later models move down by one index.
    pub fn remove(&mut self, index: usize) -> Option<SharedReconstruction> {
        (index < self.models.len()).then(|| self.models.remove(index))
    }

    /// The current index of a model handle.
    pub fn position(&self, model: &SharedReconstruction) -> Option<usize> {
        self.models.iter().position(|other| Arc::ptr_eq(other, model))
    }

    /// Remove a model by handle, wherever it currently is.
    pub fn remove_model(&mut self, model: &SharedReconstruction) -> Option<usize> {
        let index = self.position(model)?;
        self.models.remove(index);
        Some(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedReconstruction> + '_ {
        self.models.iter()
    }

    pub fn clear(&mut self) {
        self.models.clear();
    }

    /// The index of the model with the most tracks. Ties go to the earlier model.
    pub fn largest(&self) -> Option<usize> {
        self.models
            .iter()
            .map(|model| model.read().num_tracks())
            .enumerate()
            .fold(None, |best: Option<(usize, usize)>, (index, tracks)| match best {
                Some((_, most)) if most >= tracks => best,
                _ => Some((index, tracks)),
            })
            .map(|(index, _)| index)
    }

    /// Move the model with the most tracks to index 0, keeping the order of the rest.
    pub fn promote_largest(&mut self) {
        if let Some(index) = self.largest() {
            if index != 0 {
                info!("promoting model {} to index 0", index);
                let model = self.models.remove(index);
                self.models.insert(0, model);
            }
        }
    }
}

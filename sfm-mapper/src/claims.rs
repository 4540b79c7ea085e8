use crate::ImageId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

const UNCLAIMED: u64 = u64::MAX;

/// Which model an image is being registered into.
///
/// Each model of a run gets a distinct tag. An image can only be claimed by one tag at a time,
/// which keeps concurrently growing models from registering the same image.
#[derive(Debug)]
pub struct ImageClaims {
    slots: BTreeMap<ImageId, AtomicU64>,
}

impl ImageClaims {
    pub fn new(images: impl IntoIterator<Item = ImageId>) -> Self {
        Self {
            slots: images
                .into_iter()
                .map(|image| (image, AtomicU64::new(UNCLAIMED)))
                .collect(),
        }
    }

    /// Whether the image takes part in the run at all.
    pub fn contains(&self, image: ImageId) -> bool {
        self.slots.contains_key(&image)
    }

    /// Claim an unclaimed image for a model.
    ///
    /// Returns `true` if the image is now claimed by the model, including when it already was.
    pub fn claim(&self, image: ImageId, model: u64) -> bool {
        self.slots.get(&image).map_or(false, |slot| {
            match slot.compare_exchange(UNCLAIMED, model, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => true,
                Err(owner) => owner == model,
            }
        })
    }

    /// Release an image held by a model. Returns `false` if the model did not hold it.
    pub fn release(&self, image: ImageId, model: u64) -> bool {
        self.slots.get(&image).map_or(false, |slot| {
            slot.compare_exchange(model, UNCLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Release every image held by a model.
    pub fn release_all(&self, model: u64) -> usize {
        self.slots
            .keys()
            .filter(|&&image| self.release(image, model))
            .count()
    }

    pub fn owner(&self, image: ImageId) -> Option<u64> {
        self.slots
            .get(&image)
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&owner| owner != UNCLAIMED)
    }

    /// Whether the model could register the image: it exists and nobody else holds it.
    pub fn is_available(&self, image: ImageId, model: u64) -> bool {
        self.slots.contains_key(&image)
            && self.owner(image).map_or(true, |owner| owner == model)
    }

    /// Images nobody holds.
    pub fn unclaimed(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.load(Ordering::Acquire) == UNCLAIMED)
            .map(|(&image, _)| image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_model_wins_a_claim() {
        let claims = Arc::new(ImageClaims::new((0..64).map(ImageId)));
        let winners: Vec<usize> = (0..4u64)
            .map(|model| {
                let claims = claims.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .filter(|&image| claims.claim(ImageId(image), model))
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(winners.iter().sum::<usize>(), 64);
        assert_eq!(claims.unclaimed().count(), 0);
    }

    #[test]
    fn release_requires_ownership() {
        let claims = ImageClaims::new([ImageId(1), ImageId(2)]);
        assert!(claims.claim(ImageId(1), 7));
        assert!(claims.claim(ImageId(1), 7));
        assert!(!claims.claim(ImageId(1), 8));
        assert!(!claims.release(ImageId(1), 8));
        assert!(!claims.claim(ImageId(3), 7));
        assert!(claims.is_available(ImageId(2), 8));
        assert_eq!(claims.release_all(7), 1);
        assert_eq!(claims.owner(ImageId(1)), None);
    }
}

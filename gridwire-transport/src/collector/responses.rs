use gridwire_core::Address;

use crate::response::Response;

/// One response slot per target, filled at most once.
///
/// Targets are looked up by index, so a duplicate answer from the same sender
/// is detected without a map.
pub struct Responses<V> {
    targets: Vec<Address>,
    slots: Vec<Option<Response<V>>>,
    missing: usize,
}

impl<V> Responses<V> {
    /// Slots for `targets`, all empty.
    pub fn new(targets: Vec<Address>) -> Self {
        let missing = targets.len();
        let slots = std::iter::repeat_with(|| None).take(missing).collect();
        Self {
            targets,
            slots,
            missing,
        }
    }

    /// The targets, in the order they were given.
    pub fn targets(&self) -> &[Address] {
        &self.targets
    }

    /// Slot index of `address`.
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.targets.iter().position(|t| t == address)
    }

    /// Whether slot `index` is already filled.
    pub fn is_filled(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// Fill slot `index` unless it already holds a response.
    ///
    /// Returns `false` when the slot was already filled or does not exist.
    pub fn set_if_absent(&mut self, index: usize, response: Response<V>) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(response);
                self.missing -= 1;
                true
            }
            _ => false,
        }
    }

    /// The response recorded for slot `index`.
    pub fn get(&self, index: usize) -> Option<&Response<V>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Number of targets that have not answered.
    pub fn missing_count(&self) -> usize {
        self.missing
    }

    /// Whether every target answered.
    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Targets that have not answered.
    pub fn missing_targets(&self) -> Vec<Address> {
        self.targets
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(target, _)| target.clone())
            .collect()
    }
}

//! Point label storage for topology metadata.
//!
//! Labels map local point indices → integer tags, grouped by label name
//! ("Face Sets", "Cell Sets", material ids, ...).

use std::collections::{BTreeSet, HashMap};

/// Named integer labels for mesh points.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: HashMap<String, HashMap<usize, i32>>,
}

impl LabelSet {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `value` for `point` under label `name`.
    ///
    /// Returns the previous value, if any.
    pub fn set_label(&mut self, point: usize, name: &str, value: i32) -> Option<i32> {
        self.labels
            .entry(name.to_string())
            .or_default()
            .insert(point, value)
    }

    /// Returns the label value for `point` under `name`.
    pub fn get_label(&self, point: usize, name: &str) -> Option<i32> {
        self.labels
            .get(name)
            .and_then(|map| map.get(&point).copied())
    }

    /// Returns all points with label `name == value`.
    pub fn points_with_label<'a>(
        &'a self,
        name: &'a str,
        value: i32,
    ) -> impl Iterator<Item = usize> + 'a {
        self.labels.get(name).into_iter().flat_map(move |map| {
            map.iter()
                .filter_map(move |(&point, &label_value)| (label_value == value).then_some(point))
        })
    }

    /// Returns the number of points with label `name == value`.
    pub fn stratum_size(&self, name: &str, value: i32) -> usize {
        self.points_with_label(name, value).count()
    }

    /// Returns all points with label `name == value` in ascending order.
    pub fn stratum_points(&self, name: &str, value: i32) -> Vec<usize> {
        let mut points: Vec<_> = self.points_with_label(name, value).collect();
        points.sort_unstable();
        points
    }

    /// Returns all distinct values stored for label `name`, sorted ascending.
    pub fn stratum_values(&self, name: &str) -> Vec<i32> {
        let values: BTreeSet<i32> = self
            .labels
            .get(name)
            .map(|map| map.values().copied().collect())
            .unwrap_or_default();
        values.into_iter().collect()
    }

    /// Label names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.labels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// `(name, value)` pairs carried by one point, sorted by name.
    pub fn labels_of(&self, point: usize) -> Vec<(&str, i32)> {
        let mut out: Vec<(&str, i32)> = self
            .labels
            .iter()
            .filter_map(|(name, map)| map.get(&point).map(|&v| (name.as_str(), v)))
            .collect();
        out.sort_unstable();
        out
    }

    /// Returns true when the label set has no entries.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate over all labels as `(name, point, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, i32)> + '_ {
        self.labels.iter().flat_map(|(name, map)| {
            map.iter()
                .map(move |(&point, &value)| (name.as_str(), point, value))
        })
    }
}

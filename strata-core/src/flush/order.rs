//! Measurement order hints for the encoding stage

use std::collections::HashMap;

/// Decides the order in which the measurements of a device are flushed
pub trait MeasurementOrder: Send + Sync {
    fn order(&self, device: &str, measurements: Vec<String>) -> Vec<String>;
}

/// Plain lexicographic order
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicOrder;

impl MeasurementOrder for LexicographicOrder {
    fn order(&self, _device: &str, mut measurements: Vec<String>) -> Vec<String> {
        measurements.sort();
        measurements
    }
}

/// Order given per device; measurements not listed follow in
/// lexicographic order
#[derive(Debug, Default, Clone)]
pub struct SchemaOrder {
    orders: HashMap<String, Vec<String>>,
}

impl SchemaOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: impl Into<String>, measurements: Vec<String>) -> Self {
        self.orders.insert(device.into(), measurements);
        self
    }
}

impl MeasurementOrder for SchemaOrder {
    fn order(&self, device: &str, mut measurements: Vec<String>) -> Vec<String> {
        let preferred = match self.orders.get(device) {
            Some(preferred) => preferred,
            None => return LexicographicOrder.order(device, measurements),
        };
        let rank = |m: &String| preferred.iter().position(|p| p == m).unwrap_or(usize::MAX);
        measurements.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
        measurements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_order_falls_back() {
        let order = SchemaOrder::new().with_device("root.sg.d0", vec!["s2".into(), "s0".into()]);
        let input = vec!["s0".to_string(), "s1".to_string(), "s2".to_string(), "a".to_string()];
        assert_eq!(order.order("root.sg.d0", input.clone()), vec!["s2", "s0", "a", "s1"]);
        assert_eq!(order.order("root.sg.d1", input), vec!["a", "s0", "s1", "s2"]);
    }
}

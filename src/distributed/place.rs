//! Device placements and the canonical keys used for communicator caching.

use std::fmt;

use crate::utils::error::{Result, XcclError};

/// One device of a given type, e.g. `custom_cpu:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Place {
    device_type: String,
    device_id: usize,
}

impl Place {
    pub fn new(device_type: impl Into<String>, device_id: usize) -> Self {
        Self {
            device_type: device_type.into(),
            device_id,
        }
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.device_id)
    }
}

/// Ordered list of distinct places used together by one collective call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    places: Vec<Place>,
    key: String,
}

impl DeviceSet {
    /// Builds a device set, rejecting empty lists and repeated devices.
    pub fn new(places: Vec<Place>) -> Result<Self> {
        if places.is_empty() {
            return Err(XcclError::PreconditionNotMet(
                "Not able to create/get a communicator since the places are not known".to_string(),
            ));
        }
        for (i, place) in places.iter().enumerate() {
            if places[..i].contains(place) {
                return Err(XcclError::InvalidArgument(format!(
                    "Tensors must be on distinct devices, {} appears twice",
                    place
                )));
            }
        }
        let key = places_key(&places);
        Ok(Self { places, key })
    }

    pub fn singleton(place: Place) -> Self {
        let key = place.to_string();
        Self {
            places: vec![place],
            key,
        }
    }

    pub fn places(&self) -> &[Place] {
        &self.places
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }

    pub fn position(&self, place: &Place) -> Option<usize> {
        self.places.iter().position(|p| p == place)
    }
}

/// Canonical cache key: places joined by `,` in call order.
pub fn places_key(places: &[Place]) -> String {
    places
        .iter()
        .map(Place::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

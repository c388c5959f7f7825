use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const SECURE_PORT: u16 = 6443;
pub const INSECURE_PORT: u16 = 6080;
pub const CHECK_ENDPOINTS_PORT: u16 = 17697;

pub const CANONICAL_PORTS: [u16; 3] = [SECURE_PORT, INSECURE_PORT, CHECK_ENDPOINTS_PORT];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port {port} is not in the rotation of secure port 6443 (offset must be 0, 1 or 2)")]
    OutOfRotation { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Zero,
    One,
    Two,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Zero, Slot::One, Slot::Two];

    pub fn offset(self) -> u16 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_offset(offset: u16) -> Option<Self> {
        match offset {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    /// A port of 0 means no instance is active and resolves to [`Slot::Zero`],
    /// so first-ever startup rotates to [`Slot::One`] like any other rollout.
    pub fn for_active_port(active_port: u16) -> Result<Self, PortError> {
        if active_port == 0 {
            return Ok(Self::Zero);
        }
        active_port
            .checked_sub(SECURE_PORT)
            .and_then(Self::from_offset)
            .ok_or(PortError::OutOfRotation { port: active_port })
    }

    pub fn next(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Two,
            Self::Two => Self::Zero,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.offset())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    slot: Slot,
}

impl PortMap {
    pub fn for_slot(slot: Slot) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn get(&self, canonical: u16) -> u16 {
        if CANONICAL_PORTS.contains(&canonical) {
            canonical + self.slot.offset()
        } else {
            canonical
        }
    }

    pub fn secure_port(&self) -> u16 {
        self.get(SECURE_PORT)
    }

    pub fn insecure_port(&self) -> u16 {
        self.get(INSECURE_PORT)
    }

    pub fn check_endpoints_port(&self) -> u16 {
        self.get(CHECK_ENDPOINTS_PORT)
    }

    pub fn entries(&self) -> [(u16, u16); 3] {
        CANONICAL_PORTS.map(|canonical| (canonical, self.get(canonical)))
    }
}

impl Serialize for PortMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PortMap", 4)?;
        state.serialize_field("offset", &self.slot.offset())?;
        state.serialize_field("secure", &self.secure_port())?;
        state.serialize_field("insecure", &self.insecure_port())?;
        state.serialize_field("check_endpoints", &self.check_endpoints_port())?;
        state.end()
    }
}

pub fn offset_for_active_port(active_port: u16) -> u16 {
    active_port % SECURE_PORT
}

pub fn active_port_map(active_port: u16) -> Result<PortMap, PortError> {
    Slot::for_active_port(active_port).map(PortMap::for_slot)
}

pub fn next_port_map(active_port: u16) -> Result<PortMap, PortError> {
    Slot::for_active_port(active_port).map(|slot| PortMap::for_slot(slot.next()))
}

#[cfg(test)]
mod tests {
    use super::{
        active_port_map, next_port_map, offset_for_active_port, PortError, PortMap, Slot,
        SECURE_PORT,
    };

    #[test]
    fn next_map_never_collides_with_active_offset() {
        for port in [SECURE_PORT, SECURE_PORT + 1, SECURE_PORT + 2] {
            let next = next_port_map(port).expect("next map");
            assert_ne!(next.slot().offset(), offset_for_active_port(port));
            assert_ne!(next.secure_port(), port);
        }
    }

    #[test]
    fn rotation_cycles_through_three_slots() {
        let mut port = SECURE_PORT;
        let mut seen = Vec::new();
        for _ in 0..4 {
            let next = next_port_map(port).expect("next map");
            seen.push(next.slot().offset());
            port = next.secure_port();
        }
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }

    #[test]
    fn missing_active_instance_rotates_to_slot_one() {
        let next = next_port_map(0).expect("next map");
        assert_eq!(next.slot(), Slot::One);
        assert_eq!(
            next.entries(),
            [(6443, 6444), (6080, 6081), (17697, 17698)]
        );
    }

    #[test]
    fn active_map_recovers_current_offset() {
        let map = active_port_map(6445).expect("active map");
        assert_eq!(map.slot(), Slot::Two);
        assert_eq!(map.insecure_port(), 6082);
        assert_eq!(map.check_endpoints_port(), 17699);
        assert_eq!(map.get(22), 22);
    }

    #[test]
    fn ports_outside_rotation_are_rejected() {
        assert_eq!(
            active_port_map(6446),
            Err(PortError::OutOfRotation { port: 6446 })
        );
        assert_eq!(
            next_port_map(8443),
            Err(PortError::OutOfRotation { port: 8443 })
        );
        assert_eq!(
            active_port_map(443),
            Err(PortError::OutOfRotation { port: 443 })
        );
    }

    #[test]
    fn slot_round_trips_offset() {
        for slot in Slot::ALL {
            assert_eq!(Slot::from_offset(slot.offset()), Some(slot));
            assert_eq!(PortMap::for_slot(slot).secure_port(), SECURE_PORT + slot.offset());
        }
    }
}

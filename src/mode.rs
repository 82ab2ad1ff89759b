use std::fmt;

/// Airframe class reported in the heartbeat. The set of valid flight modes
/// depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VehicleType {
    #[default]
    Unknown = 0,
    Plane = 1,
    Copter = 2,
    Rover = 10,
}

impl From<u8> for VehicleType {
    fn from(value: u8) -> VehicleType {
        match value {
            1 => VehicleType::Plane,
            // quad, coax, heli, hexa, octo, tri
            2 | 3 | 4 | 13 | 14 | 15 => VehicleType::Copter,
            // ground rover, surface boat
            10 | 11 => VehicleType::Rover,
            _ => VehicleType::Unknown,
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleType::Unknown => "unknown",
            VehicleType::Plane => "plane",
            VehicleType::Copter => "copter",
            VehicleType::Rover => "rover",
        };
        f.write_str(name)
    }
}

/// A flight mode valid for one vehicle type, carried on the wire as the
/// autopilot's custom mode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VehicleMode {
    vehicle_type: VehicleType,
    number: u32,
    label: &'static str,
}

const fn copter(number: u32, label: &'static str) -> VehicleMode {
    VehicleMode {
        vehicle_type: VehicleType::Copter,
        number,
        label,
    }
}

const fn plane(number: u32, label: &'static str) -> VehicleMode {
    VehicleMode {
        vehicle_type: VehicleType::Plane,
        number,
        label,
    }
}

const fn rover(number: u32, label: &'static str) -> VehicleMode {
    VehicleMode {
        vehicle_type: VehicleType::Rover,
        number,
        label,
    }
}

static COPTER_MODES: [VehicleMode; 12] = [
    copter(0, "Stabilize"),
    copter(1, "Acro"),
    copter(2, "Alt Hold"),
    copter(3, "Auto"),
    copter(4, "Guided"),
    copter(5, "Loiter"),
    copter(6, "RTL"),
    copter(7, "Circle"),
    copter(9, "Land"),
    copter(11, "Drift"),
    copter(13, "Sport"),
    copter(16, "PosHold"),
];

static PLANE_MODES: [VehicleMode; 13] = [
    plane(0, "Manual"),
    plane(1, "Circle"),
    plane(2, "Stabilize"),
    plane(3, "Training"),
    plane(4, "Acro"),
    plane(5, "FBW A"),
    plane(6, "FBW B"),
    plane(7, "Cruise"),
    plane(8, "Autotune"),
    plane(10, "Auto"),
    plane(11, "RTL"),
    plane(12, "Loiter"),
    plane(15, "Guided"),
];

static ROVER_MODES: [VehicleMode; 7] = [
    rover(0, "Manual"),
    rover(1, "Acro"),
    rover(3, "Steering"),
    rover(4, "Hold"),
    rover(10, "Auto"),
    rover(11, "RTL"),
    rover(15, "Guided"),
];

impl VehicleType {
    /// All modes the vehicle type accepts, in mode number order.
    pub fn modes(self) -> &'static [VehicleMode] {
        match self {
            VehicleType::Copter => &COPTER_MODES,
            VehicleType::Plane => &PLANE_MODES,
            VehicleType::Rover => &ROVER_MODES,
            VehicleType::Unknown => &[],
        }
    }

    pub fn mode(self, number: u32) -> Option<VehicleMode> {
        self.modes().iter().copied().find(|m| m.number == number)
    }

    /// case insensitive lookup by display label
    pub fn mode_by_label(self, label: &str) -> Option<VehicleMode> {
        self.modes()
            .iter()
            .copied()
            .find(|m| m.label.eq_ignore_ascii_case(label.trim()))
    }
}

impl VehicleMode {
    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }
    pub fn number(&self) -> u32 {
        self.number
    }
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Display for VehicleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_type_codes_collapse_to_classes() {
        assert_eq!(VehicleType::from(2), VehicleType::Copter);
        assert_eq!(VehicleType::from(13), VehicleType::Copter);
        assert_eq!(VehicleType::from(1), VehicleType::Plane);
        assert_eq!(VehicleType::from(11), VehicleType::Rover);
        assert_eq!(VehicleType::from(6), VehicleType::Unknown);
    }

    #[test]
    fn mode_sets_differ_per_vehicle_type() {
        let loiter = VehicleType::Copter.mode_by_label("loiter").unwrap();
        assert_eq!(loiter.number(), 5);
        assert_eq!(loiter.vehicle_type(), VehicleType::Copter);

        assert_eq!(VehicleType::Plane.mode(12).unwrap().label(), "Loiter");
        assert!(VehicleType::Rover.mode_by_label("Loiter").is_none());
        assert!(VehicleType::Unknown.modes().is_empty());
    }

    #[test]
    fn unknown_mode_number_is_none() {
        assert!(VehicleType::Copter.mode(8).is_none());
        assert!(VehicleType::Plane.mode(99).is_none());
    }
}

//! Growatt photovoltaic inverters (MIN/MIC TL-X series).
//!
//! Both blocks are read as fixed 125-register windows; the layouts only
//! describe the part that is published.

use super::{Driver, RegisterBlock, RegisterKind};
use crate::codec::{FieldSpec, Item, RegisterLayout};

const fn deci_u16(name: &'static str) -> Item {
    Item::Field(FieldSpec::u16(name).scaled(1, 10))
}

const fn deci_u32(name: &'static str) -> Item {
    Item::Field(FieldSpec::u32(name).scaled(1, 10))
}

/// Holding registers 3000.., serial number after the first register.
pub const IDENTIFICATION: RegisterLayout = RegisterLayout::new(&[
    Item::Seek(2),
    Item::Field(FieldSpec::text("SerialNumber", 30)),
]);

/// Input registers 0..
pub const MEASUREMENTS: RegisterLayout = RegisterLayout::new(&[
    Item::Field(FieldSpec::u16("InverterStatus")),
    deci_u32("InputPower"),
    deci_u16("PV1Voltage"),
    deci_u16("PV1InputCurrent"),
    deci_u32("PV1InputPower"),
    deci_u16("PV2Voltage"),
    deci_u16("PV2InputCurrent"),
    deci_u32("PV2InputPower"),
    Item::Seek(35 * 2),
    deci_u32("OutputPower"),
    Item::Field(FieldSpec::u16("GridFrequency").scaled(1, 100)),
    deci_u16("L1ThreePhaseGridVoltage"),
    deci_u16("L1ThreePhaseGridOutputCurrent"),
    deci_u32("L1ThreePhaseGridOutputPower"),
    Item::Seek(53 * 2),
    Item::Field(FieldSpec::u32("TodayGenerateEnergy").scaled(100, 1)),
    Item::Field(FieldSpec::u32("TotalGenerateEnergy").scaled(100, 1)),
    Item::Seek(93 * 2),
    deci_u16("InverterTemperature"),
    Item::Seek(105 * 2),
    Item::Field(FieldSpec::u16("FaultMainCode")),
    Item::Field(FieldSpec::u16("FaultSubCode")),
]);

pub const DRIVER: Driver = Driver {
    name: "growatt_inverter",
    identification: RegisterBlock::new(RegisterKind::Holding, 3000, IDENTIFICATION)
        .with_count(125),
    serial_field: "SerialNumber",
    identity_topics: &[("SerialNumber", "info/serial_number")],
    measurements: &[RegisterBlock::new(RegisterKind::Input, 0, MEASUREMENTS).with_count(125)],
    topics: &[
        ("InputPower", "0/powerdc"),
        ("PV1Voltage", "1/voltage"),
        ("PV1InputCurrent", "1/current"),
        ("PV1InputPower", "1/power"),
        ("PV2Voltage", "2/voltage"),
        ("PV2InputCurrent", "2/current"),
        ("PV2InputPower", "2/power"),
        ("GridFrequency", "0/frequency"),
        ("L1ThreePhaseGridVoltage", "0/voltage"),
        ("L1ThreePhaseGridOutputCurrent", "0/current"),
        ("L1ThreePhaseGridOutputPower", "0/power"),
        ("TodayGenerateEnergy", "0/yieldday"),
        ("TotalGenerateEnergy", "0/yieldtotal"),
        ("InverterTemperature", "0/temperature"),
    ],
};

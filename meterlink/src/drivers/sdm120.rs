//! Eastron SDM120 single-phase meters.

use super::{Driver, RegisterBlock, RegisterKind};
use crate::codec::{FieldSpec, Item, RegisterLayout};

/// Serial number, holding register 0xFC00.
pub const IDENTIFICATION: RegisterLayout =
    RegisterLayout::new(&[Item::Field(FieldSpec::u32("SerialNumber"))]);

/// Input registers 0x0000.., every quantity a big-endian float.
pub const MEASUREMENTS: RegisterLayout = RegisterLayout::new(&[
    Item::Field(FieldSpec::f32("Voltage")),
    Item::Padding(4 * 2),
    Item::Field(FieldSpec::f32("Current")),
    Item::Padding(4 * 2),
    Item::Field(FieldSpec::f32("ActivePower")),
    Item::Padding(4 * 2),
    Item::Field(FieldSpec::f32("ApparentPower")),
    Item::Padding(4 * 2),
    Item::Field(FieldSpec::f32("ReactivePower")),
    Item::Padding(4 * 2),
    Item::Field(FieldSpec::f32("PowerFactor")),
    Item::Padding(0x26 * 2),
    Item::Field(FieldSpec::f32("Frequency")),
    Item::Field(FieldSpec::f32("ActiveImport")),
    Item::Field(FieldSpec::f32("ActiveExport")),
    Item::Field(FieldSpec::f32("ReactiveImport")),
    Item::Field(FieldSpec::f32("ReactiveExport")),
]);

pub const DRIVER: Driver = Driver {
    name: "sdm120",
    identification: RegisterBlock::new(RegisterKind::Holding, 0xFC00, IDENTIFICATION),
    serial_field: "SerialNumber",
    identity_topics: &[("SerialNumber", "info/serial_number")],
    measurements: &[RegisterBlock::new(RegisterKind::Input, 0x0000, MEASUREMENTS)],
    topics: &[
        ("ActiveImport", "energy/import"),
        ("ActiveExport", "energy/export"),
        ("Voltage", "voltage"),
        ("Current", "current"),
        ("ActivePower", "power"),
        ("Frequency", "frequency"),
    ],
};

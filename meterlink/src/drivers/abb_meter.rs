//! ABB three-phase energy meters (A/B series).
//!
//! Every scaled quantity reserves its maximum raw value for "not available",
//! which the meter reports for phases that are not wired.

use super::{Driver, RegisterBlock, RegisterKind};
use crate::codec::{FieldSpec, Item, RegisterLayout};

const fn centi_u64(name: &'static str) -> Item {
    Item::Field(FieldSpec::u64(name).scaled(1, 100).with_sentinel())
}

const fn centi_i64(name: &'static str) -> Item {
    Item::Field(FieldSpec::i64(name).scaled(1, 100).with_sentinel())
}

const fn deci_u32(name: &'static str) -> Item {
    Item::Field(FieldSpec::u32(name).scaled(1, 10).with_sentinel())
}

const fn centi_u32(name: &'static str) -> Item {
    Item::Field(FieldSpec::u32(name).scaled(1, 100).with_sentinel())
}

const fn centi_i32(name: &'static str) -> Item {
    Item::Field(FieldSpec::i32(name).scaled(1, 100).with_sentinel())
}

const fn deci_i16(name: &'static str) -> Item {
    Item::Field(FieldSpec::i16(name).scaled(1, 10).with_sentinel())
}

const fn milli_i16(name: &'static str) -> Item {
    Item::Field(FieldSpec::i16(name).scaled(1, 1000).with_sentinel())
}

const fn plain_u16(name: &'static str) -> Item {
    Item::Field(FieldSpec::u16(name).with_sentinel())
}

/// Product data and identification, holding registers 0x8900..
pub const IDENTIFICATION: RegisterLayout = RegisterLayout::new(&[
    Item::Field(FieldSpec::u32("SerialNumber")),
    Item::Padding(6 * 2),
    Item::Field(FieldSpec::text("MeterFirmwareVersion", 16)),
    Item::Field(FieldSpec::u8("ModbusMappingVersionMajor")),
    Item::Field(FieldSpec::u8("ModbusMappingVersionMinor")),
    Item::Padding((0x8960 - 0x8910 - 1) * 2),
    Item::Field(FieldSpec::text("TypeDesignation", 12)),
]);

/// Accumulated energy totals, holding registers 0x5000..
pub const ENERGY_TOTAL: RegisterLayout = RegisterLayout::new(&[
    centi_u64("ActiveImport"),
    centi_u64("ActiveExport"),
    centi_i64("ActiveNet"),
    centi_u64("ReactiveImport"),
    centi_u64("ReactiveExport"),
    centi_i64("ReactiveNet"),
    centi_u64("ApparentImport"),
    centi_u64("ApparentExport"),
    centi_i64("ApparentNet"),
    Item::Field(FieldSpec::u64("ActiveImportCo2").scaled(1, 1000).with_sentinel()),
    Item::Field(FieldSpec::u64("ActiveImportCurrency").scaled(1, 1000).with_sentinel()),
]);

/// Accumulated energy per phase, holding registers 0x5460..
pub const ENERGY_PER_PHASE: RegisterLayout = RegisterLayout::new(&[
    centi_u64("ActiveImportL1"),
    centi_u64("ActiveImportL2"),
    centi_u64("ActiveImportL3"),
    centi_u64("ActiveExportL1"),
    centi_u64("ActiveExportL2"),
    centi_u64("ActiveExportL3"),
    centi_i64("ActiveNetL1"),
    centi_i64("ActiveNetL2"),
    centi_i64("ActiveNetL3"),
    centi_u64("ReactiveImportL1"),
    centi_u64("ReactiveImportL2"),
    centi_u64("ReactiveImportL3"),
    centi_u64("ReactiveExportL1"),
    centi_u64("ReactiveExportL2"),
    centi_u64("ReactiveExportL3"),
    centi_i64("ReactiveNetL1"),
    centi_i64("ReactiveNetL2"),
    centi_i64("ReactiveNetL3"),
    centi_u64("ApparentImportL1"),
    centi_u64("ApparentImportL2"),
    centi_u64("ApparentImportL3"),
    centi_u64("ApparentExportL1"),
    centi_u64("ApparentExportL2"),
    centi_u64("ApparentExportL3"),
    centi_i64("ApparentNetL1"),
    centi_i64("ApparentNetL2"),
    centi_i64("ApparentNetL3"),
]);

/// Instantaneous values, holding registers 0x5B00..
pub const MEASUREMENTS: RegisterLayout = RegisterLayout::new(&[
    deci_u32("VoltageL1N"),
    deci_u32("VoltageL2N"),
    deci_u32("VoltageL3N"),
    deci_u32("VoltageL1L2"),
    deci_u32("VoltageL3L2"),
    deci_u32("VoltageL1L3"),
    centi_u32("CurrentL1"),
    centi_u32("CurrentL2"),
    centi_u32("CurrentL3"),
    centi_u32("CurrentN"),
    centi_i32("ActivePowerTotal"),
    centi_i32("ActivePowerL1"),
    centi_i32("ActivePowerL2"),
    centi_i32("ActivePowerL3"),
    centi_i32("ReactivePowerTotal"),
    centi_i32("ReactivePowerL1"),
    centi_i32("ReactivePowerL2"),
    centi_i32("ReactivePowerL3"),
    centi_i32("ApparentPowerTotal"),
    centi_i32("ApparentPowerL1"),
    centi_i32("ApparentPowerL2"),
    centi_i32("ApparentPowerL3"),
    Item::Field(FieldSpec::u16("Frequency").scaled(1, 100).with_sentinel()),
    deci_i16("PhaseAnglePowerTotal"),
    deci_i16("PhaseAnglePowerL1"),
    deci_i16("PhaseAnglePowerL2"),
    deci_i16("PhaseAnglePowerL3"),
    deci_i16("PhaseAngleVoltageL1"),
    deci_i16("PhaseAngleVoltageL2"),
    deci_i16("PhaseAngleVoltageL3"),
    Item::Padding(3 * 2),
    deci_i16("PhaseAngleCurrentL1"),
    deci_i16("PhaseAngleCurrentL2"),
    deci_i16("PhaseAngleCurrentL3"),
    milli_i16("PowerFactorTotal"),
    milli_i16("PowerFactorL1"),
    milli_i16("PowerFactorL2"),
    milli_i16("PowerFactorL3"),
    plain_u16("CurrentQuadrantTotal"),
    plain_u16("CurrentQuadrantL1"),
    plain_u16("CurrentQuadrantL2"),
    plain_u16("CurrentQuadrantL3"),
]);

pub const DRIVER: Driver = Driver {
    name: "abb_meter",
    identification: RegisterBlock::new(RegisterKind::Holding, 0x8900, IDENTIFICATION),
    serial_field: "SerialNumber",
    identity_topics: &[
        ("SerialNumber", "info/serial_number"),
        ("MeterFirmwareVersion", "info/firmware_version"),
        ("ModbusMappingVersionMajor", "info/mapping_version/major"),
        ("ModbusMappingVersionMinor", "info/mapping_version/minor"),
        ("TypeDesignation", "info/type"),
    ],
    measurements: &[
        RegisterBlock::new(RegisterKind::Holding, 0x5000, ENERGY_TOTAL),
        RegisterBlock::new(RegisterKind::Holding, 0x5460, ENERGY_PER_PHASE),
        RegisterBlock::new(RegisterKind::Holding, 0x5B00, MEASUREMENTS),
    ],
    topics: &[
        ("ActiveImport", "energy/import"),
        ("ActiveExport", "energy/export"),
        ("ActiveNet", "energy/net"),
        ("ActiveImportL1", "energy/import/L1"),
        ("ActiveImportL2", "energy/import/L2"),
        ("ActiveImportL3", "energy/import/L3"),
        ("ActiveExportL1", "energy/export/L1"),
        ("ActiveExportL2", "energy/export/L2"),
        ("ActiveExportL3", "energy/export/L3"),
        ("ActiveNetL1", "energy/net/L1"),
        ("ActiveNetL2", "energy/net/L2"),
        ("ActiveNetL3", "energy/net/L3"),
        ("VoltageL1N", "voltage/L1"),
        ("VoltageL2N", "voltage/L2"),
        ("VoltageL3N", "voltage/L3"),
        ("CurrentL1", "current/L1"),
        ("CurrentL2", "current/L2"),
        ("CurrentL3", "current/L3"),
        ("ActivePowerTotal", "power"),
        ("ActivePowerL1", "power/L1"),
        ("ActivePowerL2", "power/L2"),
        ("ActivePowerL3", "power/L3"),
        ("Frequency", "frequency"),
    ],
};

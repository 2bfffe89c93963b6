// Drawer sensor board commands

use crate::status::{DeviceType, DsbStatus, SolenoidState};

/// Probe a peer address and read its identity.
pub const DISCOVERY: u8 = 0x01;
/// Global lock / solenoid mode / proximity enable broadcast.
pub const GLOBAL_LOCK: u8 = 0x02;
/// Read the drawer vector and the DSB status byte.
pub const GET_STATUS: u8 = 0x03;
/// Read board temperature and supply voltage.
pub const GET_TEMP: u8 = 0x04;
/// Read (and thereby clear) the board error log.
pub const GET_ERRORS: u8 = 0x05;
/// Reset every listening peer.
pub const GLOBAL_RESET: u8 = 0x06;
/// Drawer position-sensor recalibration.
pub const DRAWER_RECALIBRATION: u8 = 0x07;
/// Force one drawer locked or unlocked by index.
pub const DRAWER_OVERRIDE: u8 = 0x08;
/// Bootloader-mode identity probe (programmer only).
pub const DISCOVER_LIGHT: u8 = 0x09;
/// Factory mode on/off broadcast.
pub const FACTORY_MODE: u8 = 0x20;
/// Wipe assigned drawer indices (guarded by an override token).
pub const CLEAR_INDICES: u8 = 0x21;
/// Assign a drawer index to the board in assignment mode.
pub const ASSIGN_INDEX: u8 = 0x22;
/// Per-sensor diagnostic value readout.
pub const GET_DEBUG: u8 = 0x51;
/// Enter or leave bootloader mode.
pub const BOOTLOADER_MODE: u8 = 0x70;
/// One Intel-HEX record, sent to the download address (programmer only).
pub const HEX_RECORD: u8 = 0x77;

/// Unsolicited broadcast: a drawer changed state.
pub const DRAWER_STATE_EVENT: u8 = 0x99;
/// Unsolicited broadcast: a board assigned itself an index after reset.
pub const SELF_ASSIGN_EVENT: u8 = 0x9A;

/// Guard prefix a client must present to clear drawer indices.
pub const CLEAR_INDICES_TOKEN: u32 = 0x4F56_4400;

pub fn discovery_req() -> [u8; 1] {
    [0x00]
}

pub fn discover_light_req() -> [u8; 1] {
    [0x00]
}

pub fn get_status_req() -> [u8; 1] {
    [0x00]
}

pub fn get_temp_req() -> [u8; 1] {
    [0x00]
}

pub fn get_errors_req() -> [u8; 1] {
    [0x00]
}

/// Diagnostic item readout; `item` selects the sensor value to fetch.
pub fn get_debug_req(item: u8) -> [u8; 1] {
    [item]
}

/// Silence configuration broadcast ahead of discovery: opening disallowed,
/// solenoids off, proximity sensors disabled, so boards stay quiet while
/// the roster is rebuilt.
pub fn lockdown_cmd() -> [u8; 1] {
    [0x00]
}

/// Normal-operation broadcast after discovery: opening allowed, solenoids
/// in automatic mode, proximity sensors enabled.
pub fn resume_cmd() -> [u8; 1] {
    [0x07]
}

/// Global lock state with the solenoid drive sub-mode.
pub fn global_lock_cmd(locked: bool, manual_solenoids: bool) -> [u8; 1] {
    let mut v: u8 = if locked { 0x02 } else { 0x03 };
    v |= if manual_solenoids { 0x08 } else { 0x04 };
    [v]
}

/// Unlock or lock the drawer with the given index.
pub fn drawer_override_cmd(index: u8, lock: bool) -> [u8; 1] {
    let mut v = index & 0x1F;
    if !lock {
        v |= 0x20;
    }
    [v]
}

/// Recalibrate drawer position sensors, optionally persisting the result.
pub fn recalibration_cmd(save: bool) -> [u8; 1] {
    [if save { 0x02 } else { 0x01 }]
}

pub fn factory_mode_cmd(enable: bool) -> [u8; 1] {
    [if enable { 0x01 } else { 0x00 }]
}

/// `override_byte` is the low byte of a validated clear-indices token;
/// boards ignore the command without it.
pub fn clear_indices_cmd(override_byte: u8) -> [u8; 1] {
    [override_byte]
}

pub fn assign_index_cmd(index: u8) -> [u8; 1] {
    [index & 0x1F]
}

pub fn bootloader_mode_cmd(enable: bool) -> [u8; 1] {
    [if enable { 0x01 } else { 0x00 }]
}

pub fn global_reset_cmd() -> [u8; 1] {
    [0x00]
}

// Response payloads

/// Discovery reply payload (8 bytes).
///
/// `[0]` type nibble, `[1]` bootloader flag + drawer count, `[2..5]` drawer
/// index slots, `[7]` firmware version (major.minor nibbles).
pub struct DiscoveryRsp([u8; 8]);

impl DiscoveryRsp {
    pub fn from_payload(payload: &[u8]) -> Option<DiscoveryRsp> {
        let bytes: [u8; 8] = payload.try_into().ok()?;
        Some(DiscoveryRsp(bytes))
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from(self.0[0] & 0x0F)
    }

    pub fn bootloader(&self) -> bool {
        self.0[1] & 0x10 != 0
    }

    pub fn drawer_count(&self) -> u8 {
        self.0[1] & 0x0F
    }

    /// The drawer index stored in `slot` (0..3), if one is assigned there.
    /// Indices live in 1..=30; 0 and 31 mean "unassigned".
    pub fn drawer_index(&self, slot: usize) -> Option<u8> {
        let ndx = self.0.get(2 + slot)? & 0x1F;
        if (1..=30).contains(&ndx) { Some(ndx) } else { None }
    }

    pub fn version(&self) -> u8 {
        self.0[7]
    }

    pub fn version_major(&self) -> u8 {
        (self.0[7] >> 4) & 0x0F
    }

    pub fn version_minor(&self) -> u8 {
        self.0[7] & 0x0F
    }
}

/// Per-drawer flags byte: solenoid state, open flag, event kind, position.
///
/// Used both inside Get-Status replies and as the second byte of a drawer
/// state-change broadcast (where bit 4 names the event kind).
#[derive(Debug, Clone, Copy)]
pub struct DrawerFlags(u8);

impl DrawerFlags {
    pub fn solenoid(&self) -> SolenoidState {
        SolenoidState::from((self.0 >> 6) & 0x03)
    }

    pub fn open(&self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Event kind bit: false = unlock, true = lock. Only meaningful in a
    /// drawer state-change broadcast.
    pub fn is_lock_event(&self) -> bool {
        self.0 & 0x10 != 0
    }

    /// Drawer position in millimetres; 15 means "15 mm or more".
    pub fn position(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl From<u8> for DrawerFlags {
    fn from(value: u8) -> Self {
        DrawerFlags(value)
    }
}

/// Get-Status reply payload (8 bytes): three (index, flags) pairs followed
/// by the DSB status byte.
pub struct DrawerStatusRsp([u8; 8]);

impl DrawerStatusRsp {
    pub fn from_payload(payload: &[u8]) -> Option<DrawerStatusRsp> {
        let bytes: [u8; 8] = payload.try_into().ok()?;
        Some(DrawerStatusRsp(bytes))
    }

    /// The (drawer index, flags) pair in `slot` (0..3).
    pub fn pair(&self, slot: usize) -> (u8, DrawerFlags) {
        let ndx = self.0[2 * slot] & 0x1F;
        (ndx, DrawerFlags(self.0[2 * slot + 1]))
    }

    pub fn status(&self) -> DsbStatus {
        DsbStatus::from(self.0[7])
    }
}

/// Get-Temp reply payload (2 bytes): signed temperature, supply voltage.
pub struct TempRsp([u8; 2]);

impl TempRsp {
    pub fn from_payload(payload: &[u8]) -> Option<TempRsp> {
        let bytes: [u8; 2] = payload.try_into().ok()?;
        Some(TempRsp(bytes))
    }

    /// Board temperature in whole degrees C.
    pub fn temperature(&self) -> i8 {
        self.0[0] as i8
    }

    /// Supply voltage in 0.1 V steps.
    pub fn voltage_tenths(&self) -> u8 {
        self.0[1]
    }
}

/// Get-Errors reply payload (4 bytes of packed nibbles).
///
/// The low nibble of the first byte is the error count; codes follow one
/// nibble at a time starting with the high nibble of byte 0.
pub struct ErrorsRsp([u8; 4]);

impl ErrorsRsp {
    pub fn from_payload(payload: &[u8]) -> Option<ErrorsRsp> {
        let bytes: [u8; 4] = payload.try_into().ok()?;
        Some(ErrorsRsp(bytes))
    }

    pub fn count(&self) -> u8 {
        self.0[0] & 0x0F
    }

    /// The recorded error codes, in order.
    pub fn codes(&self) -> Vec<u8> {
        let count = self.count() as usize;
        let mut codes = Vec::with_capacity(count);
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                if codes.len() == count {
                    break;
                }
                codes.push(byte & 0x0F);
            }
            if codes.len() == count {
                break;
            }
            codes.push((byte >> 4) & 0x0F);
        }
        codes.truncate(count);
        codes
    }
}

/// Get-Debug reply payload (8 bytes): echoed item id and a big-endian
/// signed 32-bit value in the last four bytes.
pub struct DebugRsp([u8; 8]);

impl DebugRsp {
    pub fn from_payload(payload: &[u8]) -> Option<DebugRsp> {
        let bytes: [u8; 8] = payload.try_into().ok()?;
        Some(DebugRsp(bytes))
    }

    pub fn item(&self) -> u8 {
        self.0[0]
    }

    pub fn value(&self) -> i32 {
        i32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }
}

/// Drawer state-change broadcast payload (2 bytes).
pub struct DrawerEventRsp([u8; 2]);

impl DrawerEventRsp {
    pub fn from_payload(payload: &[u8]) -> Option<DrawerEventRsp> {
        let bytes: [u8; 2] = payload.try_into().ok()?;
        Some(DrawerEventRsp(bytes))
    }

    pub fn index(&self) -> u8 {
        self.0[0] & 0x1F
    }

    pub fn flags(&self) -> DrawerFlags {
        DrawerFlags(self.0[1])
    }
}

/// Discovery-light reply payload (2 bytes), bootloader-mode protocol.
pub struct DiscoverLightRsp([u8; 2]);

impl DiscoverLightRsp {
    pub fn from_payload(payload: &[u8]) -> Option<DiscoverLightRsp> {
        let bytes: [u8; 2] = payload.try_into().ok()?;
        Some(DiscoverLightRsp(bytes))
    }

    pub fn bootloader(&self) -> bool {
        self.0[0] & 0x10 != 0
    }

    pub fn version_major(&self) -> u8 {
        (self.0[1] >> 4) & 0x0F
    }

    pub fn version_minor(&self) -> u8 {
        self.0[1] & 0x0F
    }
}

//! Simulated reader firmware with tags on its antenna.
//!
//! [`VirtualReader`] answers Simple Protocol requests the way the reader does,
//! against an in-memory model of the tags currently in the field. It is
//! cloneable: the clone given to [`MockLink`](super::MockLink) and the clone
//! kept by a test share the same state, so a test can place or lift tags
//! while a session is running.
//!
//! Modelled behaviour:
//!
//! - search honours the LF/HF tag type masks and returns the first enabled tag
//! - HITAG 1S blocks are plain 16 byte cells
//! - MIFARE Classic sectors require a login against the trailer's key A or B
//! - DESFire keeps a PICC master key, applications with key slots, and
//!   standard data files with access rights

use super::link::Responder;
use keycreator_protocol::{hex, opcode::Opcode, tag_type};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const VERSION_STRING: &str = "TWN4/B1.64/CCL4.14/PRS1.06";
const CLASSIC_BLOCKS: usize = 64;
const FACTORY_TRAILER: [u8; 16] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x07, 0x80, 0x69, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];
const DESFIRE_3DES: u8 = 0;
const DESFIRE_FREE_ACCESS: u8 = 0xE;

/// One transponder in the simulated field.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualTag {
    pub uid: Vec<u8>,
    pub kind: VirtualTagKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VirtualTagKind {
    Hitag { blocks: HashMap<u8, [u8; 16]> },
    Classic { sak: u8, blocks: Vec<[u8; 16]> },
    Desfire { sak: u8, card: DesfireCard },
    Deister,
    Em,
}

impl VirtualTag {
    pub fn hitag(uid: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            kind: VirtualTagKind::Hitag {
                blocks: HashMap::new(),
            },
        }
    }

    /// Factory fresh MIFARE Classic 1K: transport keys, zeroed data.
    pub fn classic(uid: impl Into<Vec<u8>>) -> Self {
        let blocks = (0..CLASSIC_BLOCKS)
            .map(|i| if i % 4 == 3 { FACTORY_TRAILER } else { [0; 16] })
            .collect();
        Self {
            uid: uid.into(),
            kind: VirtualTagKind::Classic { sak: 0x08, blocks },
        }
    }

    /// Factory fresh DESFire: zero 3DES master key, no applications.
    pub fn desfire(uid: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            kind: VirtualTagKind::Desfire {
                sak: 0x20,
                card: DesfireCard::default(),
            },
        }
    }

    pub fn deister(uid: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            kind: VirtualTagKind::Deister,
        }
    }

    pub fn em(uid: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: uid.into(),
            kind: VirtualTagKind::Em,
        }
    }

    /// Override the SAK of an HF tag.
    pub fn with_sak(mut self, value: u8) -> Self {
        match &mut self.kind {
            VirtualTagKind::Classic { sak, .. } | VirtualTagKind::Desfire { sak, .. } => {
                *sak = value
            }
            _ => {}
        }
        self
    }

    fn tag_type(&self) -> u8 {
        match self.kind {
            VirtualTagKind::Hitag { .. } => tag_type::HITAG1S,
            VirtualTagKind::Classic { .. } | VirtualTagKind::Desfire { .. } => tag_type::MIFARE,
            VirtualTagKind::Deister => tag_type::DEISTER,
            VirtualTagKind::Em => tag_type::EM4102,
        }
    }

    /// Block contents of a HITAG or Classic tag.
    pub fn block(&self, index: u8) -> Option<[u8; 16]> {
        match &self.kind {
            VirtualTagKind::Hitag { blocks } => Some(blocks.get(&index).copied().unwrap_or([0; 16])),
            VirtualTagKind::Classic { blocks, .. } => blocks.get(usize::from(index)).copied(),
            _ => None,
        }
    }

    pub fn desfire_card(&self) -> Option<&DesfireCard> {
        match &self.kind {
            VirtualTagKind::Desfire { card, .. } => Some(card),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesfireKeySlot {
    pub key: Vec<u8>,
    pub key_type: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesfireFile {
    pub access_rights: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesfireApp {
    pub settings: u8,
    pub key_type: u8,
    pub keys: Vec<Vec<u8>>,
    pub files: BTreeMap<u8, DesfireFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesfireCard {
    pub master: DesfireKeySlot,
    pub settings: u8,
    pub apps: BTreeMap<u32, DesfireApp>,
    selected: u32,
    authenticated: Option<u8>,
}

impl Default for DesfireCard {
    fn default() -> Self {
        Self {
            master: DesfireKeySlot {
                key: vec![0; 16],
                key_type: DESFIRE_3DES,
            },
            settings: 0x0F,
            apps: BTreeMap::new(),
            selected: 0,
            authenticated: None,
        }
    }
}

impl DesfireCard {
    fn may_write(&self, access: u16) -> bool {
        let write = ((access >> 8) & 0xF) as u8;
        let read_write = ((access >> 4) & 0xF) as u8;
        self.access_granted(write) || self.access_granted(read_write)
    }

    fn may_read(&self, access: u16) -> bool {
        let read = ((access >> 12) & 0xF) as u8;
        let read_write = ((access >> 4) & 0xF) as u8;
        self.access_granted(read) || self.access_granted(read_write)
    }

    fn access_granted(&self, key_no: u8) -> bool {
        key_no == DESFIRE_FREE_ACCESS || self.authenticated == Some(key_no)
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    tags: Vec<VirtualTag>,
    lf_mask: u32,
    hf_mask: u32,
    classic_sector: Option<u8>,
    history: Vec<Opcode>,
    forced_status: HashMap<Opcode, u8>,
    beeps: usize,
}

/// Simulated reader. See the module documentation.
///
/// # Examples
///
/// ```
/// use keycreator_hardware::{MockLink, VirtualReader};
/// use keycreator_hardware::mock::VirtualTag;
///
/// let reader = VirtualReader::new();
/// reader.place(VirtualTag::hitag([0x04, 0x4A, 0x3C, 0x91]));
/// let (_link, _handle) = MockLink::with_responder(reader.clone());
/// assert_eq!(reader.tags().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualReader {
    state: Arc<Mutex<ReaderState>>,
}

impl VirtualReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ReaderState> {
        // A panicking test thread must not cascade into unrelated assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put a tag on the antenna.
    pub fn place(&self, tag: VirtualTag) {
        self.state().tags.push(tag);
    }

    /// Lift every tag off the antenna and return them.
    pub fn lift_all(&self) -> Vec<VirtualTag> {
        let mut state = self.state();
        state.classic_sector = None;
        std::mem::take(&mut state.tags)
    }

    pub fn tags(&self) -> Vec<VirtualTag> {
        self.state().tags.clone()
    }

    pub fn tag(&self, uid: &[u8]) -> Option<VirtualTag> {
        self.state().tags.iter().find(|t| t.uid == uid).cloned()
    }

    /// Opcodes executed so far.
    pub fn history(&self) -> Vec<Opcode> {
        self.state().history.clone()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.state().history.iter().filter(|op| **op == opcode).count()
    }

    pub fn beeps(&self) -> usize {
        self.state().beeps
    }

    /// Answer every future `opcode` with `status` instead of executing it.
    pub fn force_status(&self, opcode: Opcode, status: u8) {
        self.state().forced_status.insert(opcode, status);
    }

    pub fn clear_forced(&self) {
        self.state().forced_status.clear();
    }

    fn execute(&self, request: &str) -> String {
        let Some(code) = request.get(..4).and_then(|c| u16::from_str_radix(c, 16).ok()) else {
            return "05".to_string();
        };
        let Some(opcode) = Opcode::from_code(code) else {
            return "01".to_string();
        };

        let mut state = self.state();
        state.history.push(opcode);
        if let Some(status) = state.forced_status.get(&opcode) {
            return format!("{status:02X}");
        }

        let mut params = Params::new(&request[4..]);
        match state.dispatch(opcode, &mut params) {
            Some(payload) if params.is_exhausted() => format!("00{payload}"),
            Some(_) => "03".to_string(),
            None => "02".to_string(),
        }
    }
}

impl Responder for VirtualReader {
    fn respond(&mut self, request: &str) -> Option<String> {
        Some(format!("{}\r", self.execute(request)))
    }
}

/// Cursor over a request's hex parameters.
struct Params<'a> {
    hex: &'a str,
    pos: usize,
}

impl<'a> Params<'a> {
    fn new(hex: &'a str) -> Self {
        Self { hex, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let value = hex::parse_u8(self.hex, self.pos).ok()?;
        self.pos += 2;
        Some(value)
    }

    fn u16_le(&mut self) -> Option<u16> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        let value = hex::parse_u32_le(self.hex, self.pos).ok()?;
        self.pos += 8;
        Some(value)
    }

    fn bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        (0..len).map(|_| self.u8()).collect()
    }

    fn block(&mut self) -> Option<[u8; 16]> {
        self.bytes(16)?.try_into().ok()
    }

    fn prefixed(&mut self) -> Option<Vec<u8>> {
        let len = self.u8()?;
        self.bytes(usize::from(len))
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.hex.len()
    }
}

fn flag(value: bool) -> String {
    (if value { "01" } else { "00" }).to_string()
}

impl ReaderState {
    /// Execute one command. `None` means a parameter was missing.
    fn dispatch(&mut self, opcode: Opcode, p: &mut Params<'_>) -> Option<String> {
        match opcode {
            Opcode::Reset => Some(String::new()),
            Opcode::GetVersionString => {
                let max = usize::from(p.u8()?);
                let version = &VERSION_STRING[..VERSION_STRING.len().min(max)];
                Some(format!(
                    "{:02X}{}",
                    version.len(),
                    hex::bytes_hex(version.as_bytes())
                ))
            }
            Opcode::Beep => {
                p.u8()?;
                p.u16_le()?;
                p.u16_le()?;
                p.u16_le()?;
                self.beeps += 1;
                Some(String::new())
            }
            Opcode::LedInit | Opcode::LedOn | Opcode::LedOff => {
                p.u8()?;
                Some(String::new())
            }
            Opcode::LedBlink => {
                p.u8()?;
                p.u16_le()?;
                p.u16_le()?;
                Some(String::new())
            }
            Opcode::SetTagTypes => {
                self.lf_mask = p.u32_le()?;
                self.hf_mask = p.u32_le()?;
                Some(String::new())
            }
            Opcode::SearchTag => {
                let max_id = usize::from(p.u8()?);
                Some(self.search(max_id))
            }
            Opcode::GetSak => Some(self.sak()),
            Opcode::HitagReadBlock => {
                let block = p.u8()?;
                Some(self.hitag_read(block))
            }
            Opcode::HitagWriteBlock => {
                let block = p.u8()?;
                let data = p.block()?;
                Some(self.hitag_write(block, data))
            }
            Opcode::ClassicLogin => {
                let key = p.bytes(6)?;
                let key_type = p.u8()?;
                let sector = p.u8()?;
                Some(self.classic_login(&key, key_type, sector))
            }
            Opcode::ClassicReadBlock => {
                let block = p.u8()?;
                Some(self.classic_read(block))
            }
            Opcode::ClassicWriteBlock => {
                let block = p.u8()?;
                let data = p.block()?;
                Some(self.classic_write(block, data))
            }
            _ => self.desfire(opcode, p),
        }
    }

    fn search(&mut self, max_id: usize) -> String {
        let (lf, hf) = (self.lf_mask, self.hf_mask);
        let found = self.tags.iter().find(|tag| {
            let tt = tag.tag_type();
            let mask = if tag_type::is_hf(tt) { hf } else { lf };
            mask & tag_type::mask(tt) != 0
        });
        match found {
            Some(tag) => {
                let uid = &tag.uid[..tag.uid.len().min(max_id)];
                let reply = format!(
                    "01{:02X}{:02X}{:02X}{}",
                    tag.tag_type(),
                    uid.len() * 8,
                    uid.len(),
                    hex::bytes_hex(uid)
                );
                // Re-selecting a tag drops any sector login.
                self.classic_sector = None;
                reply
            }
            None => flag(false),
        }
    }

    fn sak(&self) -> String {
        self.tags
            .iter()
            .find_map(|tag| match tag.kind {
                VirtualTagKind::Classic { sak, .. } | VirtualTagKind::Desfire { sak, .. } => {
                    Some(format!("01{sak:02X}"))
                }
                _ => None,
            })
            .unwrap_or_else(|| flag(false))
    }

    fn hitag_blocks(&mut self) -> Option<&mut HashMap<u8, [u8; 16]>> {
        self.tags.iter_mut().find_map(|tag| match &mut tag.kind {
            VirtualTagKind::Hitag { blocks } => Some(blocks),
            _ => None,
        })
    }

    fn hitag_read(&mut self, block: u8) -> String {
        match self.hitag_blocks() {
            Some(blocks) => {
                let data = blocks.get(&block).copied().unwrap_or([0; 16]);
                format!("0110{}", hex::bytes_hex(&data))
            }
            None => flag(false),
        }
    }

    fn hitag_write(&mut self, block: u8, data: [u8; 16]) -> String {
        match self.hitag_blocks() {
            Some(blocks) => {
                blocks.insert(block, data);
                "0110".to_string()
            }
            None => flag(false),
        }
    }

    fn classic_blocks(&mut self) -> Option<&mut Vec<[u8; 16]>> {
        self.tags.iter_mut().find_map(|tag| match &mut tag.kind {
            VirtualTagKind::Classic { blocks, .. } => Some(blocks),
            _ => None,
        })
    }

    fn classic_login(&mut self, key: &[u8], key_type: u8, sector: u8) -> String {
        let trailer_index = usize::from(sector) * 4 + 3;
        let accepted = self
            .classic_blocks()
            .and_then(|blocks| blocks.get(trailer_index).copied())
            .is_some_and(|trailer| match key_type {
                0x00 => trailer[..6] == *key,
                0x01 => trailer[10..] == *key,
                _ => false,
            });
        self.classic_sector = accepted.then_some(sector);
        flag(accepted)
    }

    fn classic_read(&mut self, block: u8) -> String {
        if self.classic_sector != Some(block / 4) {
            return flag(false);
        }
        match self
            .classic_blocks()
            .and_then(|blocks| blocks.get(usize::from(block)).copied())
        {
            Some(data) => format!("01{}", hex::bytes_hex(&data)),
            None => flag(false),
        }
    }

    fn classic_write(&mut self, block: u8, data: [u8; 16]) -> String {
        if block == 0 || self.classic_sector != Some(block / 4) {
            return flag(false);
        }
        match self
            .classic_blocks()
            .and_then(|blocks| blocks.get_mut(usize::from(block)))
        {
            Some(cell) => {
                *cell = data;
                flag(true)
            }
            None => flag(false),
        }
    }

    fn desfire(&mut self, opcode: Opcode, p: &mut Params<'_>) -> Option<String> {
        let _env = p.u8()?;
        let card = self.tags.iter_mut().find_map(|tag| match &mut tag.kind {
            VirtualTagKind::Desfire { card, .. } => Some(card),
            _ => None,
        });

        // Parse parameters before looking at the card so missing parameters
        // are reported even with an empty field.
        let command = DesfireCommand::parse(opcode, p)?;
        let Some(card) = card else {
            return Some(flag(false));
        };
        Some(command.apply(card))
    }
}

enum DesfireCommand {
    Authenticate { key_no: u8, key: Vec<u8>, key_type: u8 },
    GetKeySettings,
    ChangeKeySettings { flags: u8 },
    ChangeKey { key_no: u8, old: Vec<u8>, new: Vec<u8>, key_type: u8 },
    CreateApp { aid: u32, flags: u8, num_keys: u32, key_type: u8 },
    SelectApp { aid: u32 },
    CreateDataFile { file_no: u8, access_rights: u16, size: u32 },
    WriteData { file_no: u8, offset: u16, data: Vec<u8> },
    ReadData { file_no: u8, offset: u16, len: u8 },
    FormatTag,
}

impl DesfireCommand {
    fn parse(opcode: Opcode, p: &mut Params<'_>) -> Option<Self> {
        Some(match opcode {
            Opcode::DesfireAuthenticate => {
                let key_no = p.u8()?;
                let key = p.prefixed()?;
                let key_type = p.u8()?;
                let _mode = p.u8()?;
                Self::Authenticate { key_no, key, key_type }
            }
            Opcode::DesfireGetKeySettings => Self::GetKeySettings,
            Opcode::DesfireChangeKeySettings => {
                let flags = p.u8()?;
                p.u32_le()?;
                p.u32_le()?;
                Self::ChangeKeySettings { flags }
            }
            Opcode::DesfireChangeKey => {
                let key_no = p.u8()?;
                let old = p.prefixed()?;
                let new = p.prefixed()?;
                let _version = p.u8()?;
                let _flags = p.u8()?;
                p.u32_le()?;
                let key_type = u8::try_from(p.u32_le()?).ok()?;
                Self::ChangeKey { key_no, old, new, key_type }
            }
            Opcode::DesfireCreateApp => {
                let aid = p.u32_le()?;
                let flags = p.u8()?;
                let num_keys = p.u32_le()?;
                let key_type = u8::try_from(p.u32_le()?).ok()?;
                Self::CreateApp { aid, flags, num_keys, key_type }
            }
            Opcode::DesfireSelectApp => Self::SelectApp { aid: p.u32_le()? },
            Opcode::DesfireCreateDataFile => {
                let file_no = p.u8()?;
                let _file_type = p.u8()?;
                let _comm_set = p.u8()?;
                let access_rights = p.u16_le()?;
                let size = p.u32_le()?;
                p.bytes(12)?;
                Self::CreateDataFile { file_no, access_rights, size }
            }
            Opcode::DesfireWriteData => {
                let file_no = p.u8()?;
                let offset = p.u16_le()?;
                let data = p.prefixed()?;
                let _comm_set = p.u8()?;
                Self::WriteData { file_no, offset, data }
            }
            Opcode::DesfireReadData => {
                let file_no = p.u8()?;
                let offset = p.u16_le()?;
                let len = p.u8()?;
                let _comm_set = p.u8()?;
                Self::ReadData { file_no, offset, len }
            }
            Opcode::DesfireFormatTag => Self::FormatTag,
            _ => return None,
        })
    }

    fn apply(self, card: &mut DesfireCard) -> String {
        match self {
            Self::Authenticate { key_no, key, key_type } => {
                let slot = if card.selected == 0 {
                    (key_no == 0).then(|| card.master.clone())
                } else {
                    card.apps.get(&card.selected).and_then(|app| {
                        app.keys.get(usize::from(key_no)).map(|k| DesfireKeySlot {
                            key: k.clone(),
                            key_type: app.key_type,
                        })
                    })
                };
                let ok = slot.is_some_and(|s| s.key == key && s.key_type == key_type);
                card.authenticated = ok.then_some(key_no);
                flag(ok)
            }
            Self::GetKeySettings => {
                if card.selected == 0 {
                    if card.settings & 0x02 == 0 && card.authenticated != Some(0) {
                        return flag(false);
                    }
                    format!(
                        "01{:02X}{}{}",
                        card.settings,
                        hex::u32_le_hex(1),
                        hex::u32_le_hex(u32::from(card.master.key_type))
                    )
                } else {
                    match card.apps.get(&card.selected) {
                        Some(app) => format!(
                            "01{:02X}{}{}",
                            app.settings,
                            hex::u32_le_hex(app.keys.len() as u32),
                            hex::u32_le_hex(u32::from(app.key_type))
                        ),
                        None => flag(false),
                    }
                }
            }
            Self::ChangeKeySettings { flags } => {
                if card.authenticated != Some(0) {
                    return flag(false);
                }
                if card.selected == 0 {
                    card.settings = flags;
                } else if let Some(app) = card.apps.get_mut(&card.selected) {
                    app.settings = flags;
                }
                flag(true)
            }
            Self::ChangeKey { key_no, old, new, key_type } => {
                let Some(auth) = card.authenticated else {
                    return flag(false);
                };
                if card.selected == 0 {
                    if key_no != 0 {
                        return flag(false);
                    }
                    card.master = DesfireKeySlot { key: new, key_type };
                    card.authenticated = None;
                    return flag(true);
                }
                let Some(app) = card.apps.get_mut(&card.selected) else {
                    return flag(false);
                };
                let Some(slot) = app.keys.get_mut(usize::from(key_no)) else {
                    return flag(false);
                };
                if key_no != auth && *slot != old {
                    return flag(false);
                }
                *slot = new;
                if key_no == auth {
                    card.authenticated = None;
                }
                flag(true)
            }
            Self::CreateApp { aid, flags, num_keys, key_type } => {
                let allowed = card.authenticated == Some(0) || card.settings & 0x04 != 0;
                if card.selected != 0 || !allowed || card.apps.contains_key(&aid) {
                    return flag(false);
                }
                let key_len = if key_type == 1 { 24 } else { 16 };
                card.apps.insert(
                    aid,
                    DesfireApp {
                        settings: flags,
                        key_type,
                        keys: vec![vec![0; key_len]; num_keys as usize],
                        files: BTreeMap::new(),
                    },
                );
                flag(true)
            }
            Self::SelectApp { aid } => {
                let ok = aid == 0 || card.apps.contains_key(&aid);
                if ok {
                    card.selected = aid;
                    card.authenticated = None;
                }
                flag(ok)
            }
            Self::CreateDataFile { file_no, access_rights, size } => {
                let authenticated = card.authenticated == Some(0);
                let Some(app) = card.apps.get_mut(&card.selected) else {
                    return flag(false);
                };
                if !(authenticated || app.settings & 0x04 != 0) || app.files.contains_key(&file_no) {
                    return flag(false);
                }
                app.files.insert(
                    file_no,
                    DesfireFile {
                        access_rights,
                        data: vec![0; size as usize],
                    },
                );
                flag(true)
            }
            Self::WriteData { file_no, offset, data } => {
                let Some(access) = card
                    .apps
                    .get(&card.selected)
                    .and_then(|app| app.files.get(&file_no))
                    .map(|f| f.access_rights)
                else {
                    return flag(false);
                };
                if !card.may_write(access) {
                    return flag(false);
                }
                let Some(file) = card
                    .apps
                    .get_mut(&card.selected)
                    .and_then(|app| app.files.get_mut(&file_no))
                else {
                    return flag(false);
                };
                let start = usize::from(offset);
                let Some(cells) = file.data.get_mut(start..start + data.len()) else {
                    return flag(false);
                };
                cells.copy_from_slice(&data);
                flag(true)
            }
            Self::ReadData { file_no, offset, len } => {
                let Some(file) = card
                    .apps
                    .get(&card.selected)
                    .and_then(|app| app.files.get(&file_no))
                else {
                    return flag(false);
                };
                if !card.may_read(file.access_rights) {
                    return flag(false);
                }
                let start = usize::from(offset);
                match file.data.get(start..start + usize::from(len)) {
                    Some(bytes) => format!("01{len:02X}{}", hex::bytes_hex(bytes)),
                    None => flag(false),
                }
            }
            Self::FormatTag => {
                if card.selected != 0 || card.authenticated != Some(0) {
                    return flag(false);
                }
                card.apps.clear();
                flag(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(reader: &mut VirtualReader, request: &str) -> String {
        reader
            .respond(request)
            .map(|r| r.trim_end().to_string())
            .unwrap_or_default()
    }

    fn classic_key_hex(key: [u8; 6]) -> String {
        hex::bytes_hex(&key)
    }

    #[test]
    fn test_unknown_opcode_and_missing_parameter() {
        let mut reader = VirtualReader::new();
        assert_eq!(run(&mut reader, "FFFF"), "01");
        assert_eq!(run(&mut reader, "0500"), "02");
        assert_eq!(run(&mut reader, "05001011"), "03");
    }

    #[test]
    fn test_search_honours_masks() {
        let mut reader = VirtualReader::new();
        reader.place(VirtualTag::hitag([1, 2, 3, 4]));

        run(&mut reader, &format!("0502{}{}", hex::u32_le_hex(0), hex::u32_le_hex(1)));
        assert_eq!(run(&mut reader, "050010"), "0000");

        let lf = tag_type::mask(tag_type::HITAG1S);
        run(&mut reader, &format!("0502{}{}", hex::u32_le_hex(lf), hex::u32_le_hex(0)));
        assert_eq!(run(&mut reader, "050010"), "000141200401020304");
    }

    #[test]
    fn test_classic_login_guards_sector() {
        let mut reader = VirtualReader::new();
        reader.place(VirtualTag::classic([9, 9, 9, 9]));

        let ff = classic_key_hex([0xFF; 6]);
        assert_eq!(run(&mut reader, &format!("0B00{ff}0001")), "0001");
        assert_eq!(run(&mut reader, "0B0104"), format!("0001{}", "00".repeat(16)));
        assert_eq!(run(&mut reader, "0B0108"), "0000");

        let wrong = classic_key_hex([0x11; 6]);
        assert_eq!(run(&mut reader, &format!("0B00{wrong}0001")), "0000");
        assert_eq!(run(&mut reader, "0B0104"), "0000");
    }

    #[test]
    fn test_desfire_factory_key_authenticates() {
        let mut reader = VirtualReader::new();
        reader.place(VirtualTag::desfire([1, 2, 3, 4, 5, 6, 7]));

        let zero = "00".repeat(16);
        assert_eq!(run(&mut reader, &format!("0F040000{:02X}{zero}0001", 16)), "0001");
        assert_eq!(
            run(&mut reader, "0F0500"),
            format!("00010F{}{}", hex::u32_le_hex(1), hex::u32_le_hex(0))
        );
        assert_eq!(run(&mut reader, &format!("0F040000{:02X}{zero}0201", 16)), "0000");
    }

    #[test]
    fn test_forced_status_and_history() {
        let mut reader = VirtualReader::new();
        reader.force_status(Opcode::GetSak, 0x04);
        assert_eq!(run(&mut reader, "1202"), "04");
        assert_eq!(reader.count(Opcode::GetSak), 1);

        reader.clear_forced();
        assert_eq!(run(&mut reader, "1202"), "0000");
    }

    #[test]
    fn test_version_string_is_length_prefixed() {
        let mut reader = VirtualReader::new();
        let reply = run(&mut reader, "0004FF");
        assert_eq!(&reply[2..4], format!("{:02X}", VERSION_STRING.len()));
    }
}

//! Packet filename codec.
//!
//! Every packet exchanged through the hub is identified solely by its
//! filename, `LLLGSSDD.NNN`:
//!
//! - `LLL` league number, three decimal digits
//! - `G` game letter, `B` (Barren Realms Elite) or `F` (Falcon's Eye)
//! - `SS` source BBS index, two hex digits
//! - `DD` destination BBS index, two hex digits
//! - `NNN` route sequence, `000`..=`999`
//!
//! Parsing is case-insensitive; formatting always produces upper case, so
//! `format(parse(name))` is the canonical spelling of `name`.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Size of the sequence ring. Sequence numbers wrap from 999 back to 0.
pub const SEQUENCE_MODULUS: u16 = 1000;

const PACKET_NAME_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketNameError {
    #[error("invalid packet filename {filename:?}: {reason}")]
    InvalidFilename {
        filename: String,
        reason: &'static str,
    },

    #[error("invalid league token {0:?}: expected three digits followed by B or F")]
    InvalidLeague(String),

    #[error("league token {expected} does not match packet league {found}")]
    LeagueMismatch { expected: String, found: String },
}

fn invalid(filename: &str, reason: &'static str) -> PacketNameError {
    PacketNameError::InvalidFilename {
        filename: filename.to_string(),
        reason,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity parts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameType {
    /// Barren Realms Elite.
    #[serde(rename = "B")]
    Bre,
    /// Falcon's Eye.
    #[serde(rename = "F")]
    Fe,
}

impl GameType {
    pub fn code(self) -> char {
        match self {
            GameType::Bre => 'B',
            GameType::Fe => 'F',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'B' => Some(GameType::Bre),
            'F' => Some(GameType::Fe),
            _ => None,
        }
    }

    /// Stem of the nodelist file the engine writes for this game.
    pub fn nodelist_stem(self) -> &'static str {
        match self {
            GameType::Bre => "BRNODES",
            GameType::Fe => "FENODES",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A league: three-digit number plus game, written `555B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeagueId {
    number: u16,
    game: GameType,
}

impl LeagueId {
    pub fn new(number: u16, game: GameType) -> Option<Self> {
        (number < 1000).then_some(Self { number, game })
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    /// Zero-padded league number as it appears in filenames.
    pub fn number_str(&self) -> String {
        format!("{:03}", self.number)
    }

    pub fn game(&self) -> GameType {
        self.game
    }

    /// `BRNODES.555` / `FENODES.555`.
    pub fn nodelist_filename(&self) -> String {
        format!("{}.{:03}", self.game.nodelist_stem(), self.number)
    }

    /// Reject a path-supplied league token that disagrees with a parsed
    /// packet. The token is never corrected silently.
    pub fn ensure_matches(&self, token: &str) -> Result<(), PacketNameError> {
        let requested: LeagueId = token.parse()?;
        if requested == *self {
            Ok(())
        } else {
            Err(PacketNameError::LeagueMismatch {
                expected: requested.to_string(),
                found: self.to_string(),
            })
        }
    }
}

impl fmt::Display for LeagueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}{}", self.number, self.game)
    }
}

impl FromStr for LeagueId {
    type Err = PacketNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PacketNameError::InvalidLeague(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(bad());
        }
        let game = GameType::from_code(char::from(bytes[3])).ok_or_else(bad)?;
        let number = s[..3].parse::<u16>().map_err(|_| bad())?;
        LeagueId::new(number, game).ok_or_else(bad)
    }
}

impl Serialize for LeagueId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LeagueId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One-byte BBS index, written as two upper-case hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BbsIndex(pub u8);

impl fmt::Display for BbsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl FromStr for BbsIndex {
    type Err = PacketNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid(s, "BBS index must be two hex digits"));
        }
        u8::from_str_radix(s, 16)
            .map(BbsIndex)
            .map_err(|_| invalid(s, "BBS index must be two hex digits"))
    }
}

impl Serialize for BbsIndex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BbsIndex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Position on the modulo-1000 sequence ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Sequence(u16);

impl Sequence {
    pub fn new(value: u16) -> Option<Self> {
        (value < SEQUENCE_MODULUS).then_some(Self(value))
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// The sequence that must follow this one; 999 is followed by 0.
    pub fn successor(self) -> Self {
        Self((self.0 + 1) % SEQUENCE_MODULUS)
    }

    /// Steps needed to walk forward around the ring from `self` to `other`.
    pub fn steps_to(self, other: Sequence) -> u16 {
        (other.0 + SEQUENCE_MODULUS - self.0) % SEQUENCE_MODULUS
    }
}

impl TryFrom<u16> for Sequence {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Sequence::new(value).ok_or_else(|| format!("sequence {value} is outside 0..=999"))
    }
}

impl From<Sequence> for u16 {
    fn from(value: Sequence) -> Self {
        value.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet identity
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a packet filename encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketIdentity {
    pub league: LeagueId,
    pub source: BbsIndex,
    pub dest: BbsIndex,
    pub sequence: Sequence,
}

impl PacketIdentity {
    pub fn filename(&self) -> String {
        format(self)
    }
}

impl fmt::Display for PacketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}.{}",
            self.league, self.source, self.dest, self.sequence
        )
    }
}

impl FromStr for PacketIdentity {
    type Err = PacketNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a packet filename such as `555B0102.007`.
pub fn parse(filename: &str) -> Result<PacketIdentity, PacketNameError> {
    if !filename.is_ascii() {
        return Err(invalid(filename, "non-ASCII characters"));
    }
    if filename.len() != PACKET_NAME_LEN {
        return Err(invalid(filename, "expected 12 characters"));
    }
    let Some((stem, extension)) = filename.split_once('.') else {
        return Err(invalid(filename, "missing extension separator"));
    };
    if stem.len() != 8 || extension.len() != 3 {
        return Err(invalid(filename, "expected LLLGSSDD.NNN"));
    }

    let league_part = &stem[..3];
    if !league_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(filename, "league must be three digits"));
    }
    let game = stem[3..4]
        .chars()
        .next()
        .and_then(GameType::from_code)
        .ok_or_else(|| invalid(filename, "game must be B or F"))?;
    let source = stem[4..6]
        .parse::<BbsIndex>()
        .map_err(|_| invalid(filename, "source index must be two hex digits"))?;
    let dest = stem[6..8]
        .parse::<BbsIndex>()
        .map_err(|_| invalid(filename, "destination index must be two hex digits"))?;

    if !extension.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(filename, "sequence must be three digits"));
    }
    let sequence = extension
        .parse::<u16>()
        .ok()
        .and_then(Sequence::new)
        .ok_or_else(|| invalid(filename, "sequence must be 000-999"))?;

    let number = league_part
        .parse::<u16>()
        .map_err(|_| invalid(filename, "league must be three digits"))?;
    let league =
        LeagueId::new(number, game).ok_or_else(|| invalid(filename, "league out of range"))?;

    Ok(PacketIdentity {
        league,
        source,
        dest,
        sequence,
    })
}

/// Canonical (upper-case) filename for an identity.
pub fn format(identity: &PacketIdentity) -> String {
    identity.to_string()
}

/// Recognise an engine nodelist filename (`BRNODES.555`, `FENODES.555`).
pub fn parse_nodelist_filename(filename: &str) -> Option<LeagueId> {
    let (stem, extension) = filename.split_once('.')?;
    let game = if stem.eq_ignore_ascii_case(GameType::Bre.nodelist_stem()) {
        GameType::Bre
    } else if stem.eq_ignore_ascii_case(GameType::Fe.nodelist_stem()) {
        GameType::Fe
    } else {
        return None;
    };
    if extension.len() != 3 || !extension.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    LeagueId::new(extension.parse().ok()?, game)
}

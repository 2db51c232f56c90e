//! Player persistence module
//!
//! The versioned, checksummed save-file codec and the atomic on-disk
//! store. One file per username under `data/players/<name>.sav`. The
//! visible file is always either the previous valid save or the new one:
//! writes go to a temp file, fsync, then rename over the target.
//!
//! All integers are big-endian. The trailing CRC-32 (IEEE polynomial)
//! covers every preceding byte; it detects accidental corruption only
//! and is not an authentication mechanism.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::error::SaveError;
use crate::game::player::{Appearance, Player, Position, Skills, SKILL_COUNT};
use crate::net::buffer::PacketBuf;

/// Save file magic
pub const SAVE_MAGIC: u16 = 0x2004;

/// Current save format version
pub const SAVE_VERSION: u16 = 6;

/// Smallest parseable file: header + checksum
const MIN_SAVE_LEN: usize = 20;

/// The persisted slice of a player. Decoupled from the live entity so
/// the codec can be exercised without a slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerProfile {
    pub position: Position,
    pub appearance: Appearance,
    pub design_complete: bool,
    pub run_energy: u16,
    pub playtime: u32,
    pub skills: Skills,
    pub chat_modes: u8,
    pub last_login_ms: u64,
}

impl Default for PlayerProfile {
    fn default() -> Self {
        Self {
            position: Position::spawn(),
            appearance: Appearance::default(),
            design_complete: false,
            run_energy: crate::game::player::MAX_RUN_ENERGY,
            playtime: 0,
            skills: Skills::default(),
            chat_modes: 0,
            last_login_ms: 0,
        }
    }
}

impl PlayerProfile {
    /// Capture the persistent fields of a live player
    pub fn from_player(player: &Player) -> Self {
        Self {
            position: player.position,
            appearance: player.appearance,
            design_complete: player.design_complete,
            run_energy: player.run_energy,
            playtime: player.playtime,
            skills: player.skills,
            chat_modes: player.chat_modes,
            last_login_ms: player.last_login_ms,
        }
    }

    /// Apply the persistent fields onto a live player
    pub fn apply_to(&self, player: &mut Player) {
        player.position = self.position;
        player.appearance = self.appearance;
        player.design_complete = self.design_complete;
        player.run_energy = self.run_energy;
        player.playtime = self.playtime;
        player.skills = self.skills;
        player.chat_modes = self.chat_modes;
        player.last_login_ms = self.last_login_ms;
    }

    /// Serialize to the version-6 on-disk layout, checksum included
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = PacketBuf::with_capacity(256);
        // Writes to a growable buffer cannot fail.
        let _ = buf.write_u16(SAVE_MAGIC);
        let _ = buf.write_u16(SAVE_VERSION);
        let _ = buf.write_u16(self.position.x);
        let _ = buf.write_u16(self.position.z);
        let _ = buf.write_u8(self.position.height);
        let _ = buf.write_bytes(&self.appearance.body);
        let _ = buf.write_bytes(&self.appearance.colors);
        let _ = buf.write_u8(self.appearance.gender);
        let _ = buf.write_u8(self.design_complete as u8);
        let _ = buf.write_u16(self.run_energy);
        let _ = buf.write_u32(self.playtime);
        for i in 0..SKILL_COUNT {
            let _ = buf.write_u32(self.skills.experience[i]);
            let _ = buf.write_u8(self.skills.levels[i]);
        }
        // Varps, inventories, and the AFK block are carried for format
        // compatibility; this revision persists none of that state.
        let _ = buf.write_u16(0); // varp count
        let _ = buf.write_u8(0); // inventory count
        let _ = buf.write_u8(0); // afk count
        let _ = buf.write_u16(0); // afk trailer
        let _ = buf.write_u8(self.chat_modes);
        let _ = buf.write_u64(self.last_login_ms);

        let mut hasher = Hasher::new();
        hasher.update(buf.as_slice());
        let _ = buf.write_u32(hasher.finalize());
        buf.as_slice().to_vec()
    }

    /// Decode any supported version. Fields a file's version predates
    /// default to zero.
    pub fn decode(bytes: &[u8]) -> Result<Self, SaveError> {
        if bytes.len() < MIN_SAVE_LEN {
            return Err(SaveError::TooShort(bytes.len()));
        }

        let body_len = bytes.len() - 4;
        let expected = u32::from_be_bytes([
            bytes[body_len],
            bytes[body_len + 1],
            bytes[body_len + 2],
            bytes[body_len + 3],
        ]);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..body_len]);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(SaveError::ChecksumMismatch { expected, actual });
        }

        let mut buf = PacketBuf::from_bytes(&bytes[..body_len]);
        let magic = buf.read_u16().map_err(|_| SaveError::Truncated)?;
        if magic != SAVE_MAGIC {
            return Err(SaveError::BadMagic(magic));
        }
        let version = buf.read_u16().map_err(|_| SaveError::Truncated)?;
        if version > SAVE_VERSION {
            return Err(SaveError::UnsupportedVersion(version));
        }

        let rd = |_: crate::error::CodecError| SaveError::Truncated;

        let x = buf.read_u16().map_err(rd)?;
        let z = buf.read_u16().map_err(rd)?;
        let height = buf.read_u8().map_err(rd)?;

        let mut body = [0u8; 7];
        for slot in body.iter_mut() {
            *slot = buf.read_u8().map_err(rd)?;
        }
        let mut colors = [0u8; 5];
        for slot in colors.iter_mut() {
            *slot = buf.read_u8().map_err(rd)?;
        }
        let gender = buf.read_u8().map_err(rd)?;
        let design_complete = buf.read_u8().map_err(rd)? != 0;

        let run_energy = buf.read_u16().map_err(rd)?;
        let playtime = if version >= 2 {
            buf.read_u32().map_err(rd)?
        } else {
            buf.read_u16().map_err(rd)? as u32
        };

        let mut skills = Skills::default();
        for i in 0..SKILL_COUNT {
            skills.experience[i] = buf.read_u32().map_err(rd)?;
            skills.levels[i] = buf.read_u8().map_err(rd)?;
        }

        // Varp block: content is not interpreted in this revision.
        let varp_count = buf.read_u16().map_err(rd)? as usize;
        buf.skip(varp_count * 4).map_err(rd)?;

        if version >= 5 {
            let inv_count = buf.read_u8().map_err(rd)?;
            for _ in 0..inv_count {
                skip_inventory(&mut buf)?;
            }
        }

        if version >= 3 {
            let afk_count = buf.read_u8().map_err(rd)? as usize;
            buf.skip(afk_count * 4).map_err(rd)?;
            buf.read_u16().map_err(rd)?;
        }

        let chat_modes = if version >= 4 {
            buf.read_u8().map_err(rd)?
        } else {
            0
        };

        let last_login_ms = buf.read_u64().map_err(rd)?;

        Ok(Self {
            position: Position::new(x, z, height),
            appearance: Appearance {
                gender,
                body,
                colors,
            },
            design_complete,
            run_energy,
            playtime,
            skills,
            chat_modes,
            last_login_ms,
        })
    }
}

/// Consume one inventory: container id, then slot items
fn skip_inventory(buf: &mut PacketBuf) -> Result<(), SaveError> {
    buf.read_u16().map_err(|_| SaveError::Truncated)?;
    let size = buf.read_u8().map_err(|_| SaveError::Truncated)?;
    for _ in 0..size {
        let id = buf.read_u16().map_err(|_| SaveError::Truncated)?;
        if id == 0 {
            continue;
        }
        let count = buf.read_u8().map_err(|_| SaveError::Truncated)?;
        if count == 255 {
            buf.read_u32().map_err(|_| SaveError::Truncated)?;
        }
    }
    Ok(())
}

/// On-disk save store: one file per username
pub struct SaveStore {
    dir: PathBuf,
}

impl SaveStore {
    /// Create a store rooted at `dir` (usually `data/players`)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Save path for a username
    pub fn path_for(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}.sav"))
    }

    /// Load a profile, treating every failure as "new player". A missing
    /// file is the normal first-login path; anything else is logged.
    pub fn load(&self, username: &str) -> PlayerProfile {
        let path = self.path_for(username);
        match self.try_load(&path) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!(username, "no save on disk, starting fresh");
                PlayerProfile::default()
            }
            Err(e) => {
                warn!(username, error = %e, "discarding unreadable save");
                PlayerProfile::default()
            }
        }
    }

    fn try_load(&self, path: &Path) -> Result<Option<PlayerProfile>, SaveError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SaveError::Io(e)),
        };
        PlayerProfile::decode(&bytes).map(Some)
    }

    /// Atomically persist a profile: serialize, write `<path>.tmp`,
    /// fsync, rename over the target. On failure the temp file is
    /// removed and the previous save stays intact.
    pub fn save(&self, username: &str, profile: &PlayerProfile) -> Result<(), SaveError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(username);
        let tmp = path.with_extension("sav.tmp");
        let bytes = profile.encode();

        let result = (|| -> Result<(), SaveError> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

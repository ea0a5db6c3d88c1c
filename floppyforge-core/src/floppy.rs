//! Well-known floppy geometries.
use std::fmt;

pub const FLOPPY_720K: u64 = 737_280;
pub const FLOPPY_1440K: u64 = 1_474_560;
pub const FLOPPY_2880K: u64 = 2_949_120;
pub const AMIGA_ADF_880K: u64 = 901_120;
pub const AMIGA_ADF_1760K: u64 = 1_802_240;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloppyFormat {
    Pc720K,
    Pc1440K,
    Pc2880K,
    AmigaDd,
    AmigaHd,
}

impl FloppyFormat {
    pub const ALL: [FloppyFormat; 5] = [
        FloppyFormat::Pc720K,
        FloppyFormat::Pc1440K,
        FloppyFormat::Pc2880K,
        FloppyFormat::AmigaDd,
        FloppyFormat::AmigaHd,
    ];

    pub fn size(self) -> u64 {
        match self {
            FloppyFormat::Pc720K => FLOPPY_720K,
            FloppyFormat::Pc1440K => FLOPPY_1440K,
            FloppyFormat::Pc2880K => FLOPPY_2880K,
            FloppyFormat::AmigaDd => AMIGA_ADF_880K,
            FloppyFormat::AmigaHd => AMIGA_ADF_1760K,
        }
    }

    /// Identifies a geometry from an exact byte count.
    pub fn from_size(size: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.size() == size)
    }

    pub fn is_amiga(self) -> bool {
        matches!(self, FloppyFormat::AmigaDd | FloppyFormat::AmigaHd)
    }
}

impl fmt::Display for FloppyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FloppyFormat::Pc720K => "720 KB (PC DD)",
            FloppyFormat::Pc1440K => "1.44 MB (PC HD)",
            FloppyFormat::Pc2880K => "2.88 MB (PC ED)",
            FloppyFormat::AmigaDd => "880 KB (Amiga DD)",
            FloppyFormat::AmigaHd => "1.76 MB (Amiga HD)",
        };
        f.write_str(label)
    }
}

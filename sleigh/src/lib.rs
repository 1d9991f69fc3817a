pub use sleigh_arch as arch;
pub use sleigh_bytes as bytes;
pub use sleigh_ir as ir;

pub mod emit;
pub use emit::{
    AsmInstruction, AssemblyEmit, CollectingAssemblyEmit, CollectingPcodeEmit,
    CorrespondedCollectedAsm, PcodeEmit, PcodeInstruction,
};

pub mod error;
pub use error::Error;

pub mod loader;
pub use loader::{LoadImage, PlainLoadImage};

pub mod presets;

pub mod setting;
pub use setting::{SleighConfig, SleighSetting};

pub mod sleigh;
pub use self::sleigh::Sleigh;

pub use sleigh_arch::Mode;

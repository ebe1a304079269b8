pub mod error;
pub mod services;
pub mod types;

pub use error::I30Error;
pub use services::{TimeUpdate, VolumeServices};
pub use types::{
    AttributeType, FileRecord, MftRef, Vcn, FILE_FIRST_USER, FILE_MFT, FILE_ROOT, FILE_UPCASE,
    MAX_NAME_LEN, RECORD_IN_USE, RECORD_IS_DIRECTORY,
};

pub mod models;
mod translator;

pub use models::{
    CdcMessage, CdcOperation, CdcPayload, CdcSource, ChangeRecord, ProductImage, RawChangeEvent,
    RecordSource,
};
pub use translator::ChangeTranslator;

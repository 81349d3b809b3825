pub mod ipsc;
pub mod mmdvm;
pub mod translator;

pub use translator::Translator;

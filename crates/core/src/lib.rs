pub mod error;
pub mod persona;

pub use error::{CoreError, CoreResult};
pub use persona::{PersonaCatalog, PersonaDescriptor, TraitValue};

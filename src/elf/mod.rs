pub(crate) mod debug_link;
pub(crate) mod parser;
#[allow(non_camel_case_types)]
pub(crate) mod types;

pub(crate) use parser::ElfParser;
pub(crate) use parser::SymTab;

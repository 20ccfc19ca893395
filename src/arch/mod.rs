pub(crate) mod a32;
pub(crate) mod thumb;
pub(crate) mod x64;

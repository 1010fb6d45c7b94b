use std::borrow::Cow;

/// Provider identifier - mostly static constants
pub type ProviderId = Cow<'static, str>;

/// Market Identifier Code (ISO 10383) - mostly static
pub type Mic = Cow<'static, str>;

/// Currency code (ISO 4217) - mostly static
pub type Currency = Cow<'static, str>;

/// Provider exchange code as reported alongside a symbol (e.g. "NMS", "LSE")
pub type ExchangeCode = String;

//! Attribute parsing for `#[host(...)]`.

use syn::{Attribute, LitStr};

/// Parsed `#[host(...)]` attributes on a type.
#[derive(Debug, Default)]
pub struct TypeAttrs {
    /// Class name (default: Rust struct name)
    pub name: Option<String>,
}

/// Parsed `#[host(...)]` attributes on a field.
#[derive(Debug, Default)]
pub struct FieldAttrs {
    pub get: bool,
    pub set: bool,
    /// Property name (default: field name)
    pub name: Option<String>,
}

impl TypeAttrs {
    pub fn from_attrs(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut result = Self::default();

        for attr in attrs {
            if !attr.path().is_ident("host") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    result.name = Some(value.value());
                    Ok(())
                } else {
                    Err(meta.error(format!(
                        "unknown host attribute: {}",
                        meta.path.get_ident().map(|i| i.to_string()).unwrap_or_default()
                    )))
                }
            })?;
        }

        Ok(result)
    }
}

impl FieldAttrs {
    pub fn from_attrs(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut result = Self::default();

        for attr in attrs {
            if !attr.path().is_ident("host") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("get") {
                    result.get = true;
                } else if meta.path.is_ident("set") {
                    result.set = true;
                } else if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    result.name = Some(value.value());
                } else {
                    return Err(meta.error(format!(
                        "unknown host field attribute: {}",
                        meta.path.get_ident().map(|i| i.to_string()).unwrap_or_default()
                    )));
                }
                Ok(())
            })?;
        }

        Ok(result)
    }

    /// A setter alone still needs a getter to read the value back.
    pub fn exposed(&self) -> bool {
        self.get || self.set
    }
}

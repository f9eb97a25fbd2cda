//! Certificate subject handling.

use super::IdentityError;
use crate::config::AllowList;

const CN: &str = "/CN=";
const UID_CN: &str = "/CN=UID:";

/// Strip trailing all-digit CN components (proxy levels) from a subject.
///
/// Returns the stripped subject and the offset of its last `/CN=`.
pub fn strip_proxy_levels(subject: &str) -> Result<(&str, usize), IdentityError> {
    let mut dn = subject;
    loop {
        let idx = dn.rfind(CN).ok_or(IdentityError::MalformedDn)?;
        let value = &dn[idx + CN.len()..];
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            dn = &dn[..idx];
        } else {
            return Ok((dn, idx));
        }
    }
}

/// Principal named by a stripped subject: the `UID:` CN value if there is
/// one, otherwise the last CN value, cut at the next `/`.
pub fn principal(dn: &str, last_cn: usize) -> String {
    let value = match dn.find(UID_CN) {
        Some(idx) => &dn[idx + UID_CN.len()..],
        None => &dn[last_cn + CN.len()..],
    };
    value.split('/').next().unwrap_or(value).to_string()
}

/// Resolve a certificate subject against the allow-list.
pub fn resolve(subject: &str, allowlist: &AllowList) -> Result<String, IdentityError> {
    let (dn, last_cn) = strip_proxy_levels(subject)?;
    if !allowlist.contains(dn) {
        return Err(IdentityError::UnrecognizedDn(dn.to_string()));
    }
    Ok(principal(dn, last_cn))
}

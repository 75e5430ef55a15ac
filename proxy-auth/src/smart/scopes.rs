//! SMART on FHIR v1/v2 scope parsing and enforcement.
//!
//! Scope grammar: `(user|patient|system)/(TYPE|*).(PERMISSIONS)`, where `PERMISSIONS` is
//! either `*`, the shorthand `read` (== `rs`), the shorthand `write` (== `cud`), or an
//! ordered subset of `c < r < u < d < s`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    #[error("invalid permission character: {0}")]
    InvalidPermission(char),

    #[error("permissions must be in order: c < r < u < d < s")]
    InvalidPermissionOrder,

    #[error("empty permission suffix")]
    EmptyPermission,
}

/// The SMART launch context a scope is granted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeContext {
    Patient,
    User,
    System,
}

impl ScopeContext {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "patient" => Some(Self::Patient),
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Either a specific FHIR resource type or the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    Specific(String),
    Wildcard,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Specific(s) => write!(f, "{s}"),
            Self::Wildcard => write!(f, "*"),
        }
    }
}

/// CRUDS permission set. Canonical order: create(c) < read(r) < update(u) < delete(d) < search(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
    pub search: bool,
}

impl Permissions {
    pub fn full() -> Self {
        Self {
            create: true,
            read: true,
            update: true,
            delete: true,
            search: true,
        }
    }

    /// `read` shorthand: grants read + search.
    pub fn read_shorthand() -> Self {
        Self {
            read: true,
            search: true,
            ..Default::default()
        }
    }

    /// `write` shorthand: grants create + update + delete.
    pub fn write_shorthand() -> Self {
        Self {
            create: true,
            update: true,
            delete: true,
            ..Default::default()
        }
    }

    pub fn has(&self, perm: char) -> bool {
        match perm {
            'c' => self.create,
            'r' => self.read,
            'u' => self.update,
            'd' => self.delete,
            's' => self.search,
            _ => false,
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.create {
            write!(f, "c")?;
        }
        if self.read {
            write!(f, "r")?;
        }
        if self.update {
            write!(f, "u")?;
        }
        if self.delete {
            write!(f, "d")?;
        }
        if self.search {
            write!(f, "s")?;
        }
        Ok(())
    }
}

impl FromStr for Permissions {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => return Ok(Self::full()),
            "read" => return Ok(Self::read_shorthand()),
            "write" => return Ok(Self::write_shorthand()),
            "" => return Err(ScopeError::EmptyPermission),
            _ => {}
        }

        fn perm_order(c: char) -> Option<u8> {
            match c {
                'c' => Some(1),
                'r' => Some(2),
                'u' => Some(3),
                'd' => Some(4),
                's' => Some(5),
                _ => None,
            }
        }

        let mut perms = Self::default();
        let mut last_order: Option<u8> = None;
        for c in s.chars() {
            let order = perm_order(c).ok_or(ScopeError::InvalidPermission(c))?;
            if let Some(prev) = last_order
                && order <= prev
            {
                return Err(ScopeError::InvalidPermissionOrder);
            }
            match c {
                'c' => perms.create = true,
                'r' => perms.read = true,
                'u' => perms.update = true,
                'd' => perms.delete = true,
                's' => perms.search = true,
                _ => unreachable!(),
            }
            last_order = Some(order);
        }
        Ok(perms)
    }
}

/// A single parsed SMART resource scope, e.g. `patient/Observation.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartScope {
    pub context: ScopeContext,
    pub resource_type: ResourceType,
    pub permissions: Permissions,
}

impl SmartScope {
    /// Parses one whitespace-delimited scope token.
    ///
    /// Returns `Ok(None)` when the token does not even match the
    /// `principal/type.permissions` shape (wrong principal, no `.` separator) — such
    /// tokens are not resource scopes at all (e.g. `openid`, `launch`) and are silently
    /// dropped by the caller. Returns `Err` only once the token has matched that shape
    /// but carries a malformed permission suffix — that is a hard parse error, not a
    /// thing to shrug off.
    pub fn parse_token(token: &str) -> Result<Option<Self>, ScopeError> {
        let Some((principal_str, rest)) = token.split_once('/') else {
            return Ok(None);
        };
        let Some(context) = ScopeContext::from_token(principal_str) else {
            return Ok(None);
        };

        let Some((type_str, perm_str)) = rest.split_once('.') else {
            return Ok(None);
        };

        let resource_type = if type_str == "*" {
            ResourceType::Wildcard
        } else {
            ResourceType::Specific(type_str.to_string())
        };

        let permissions = Permissions::from_str(perm_str)?;

        Ok(Some(Self {
            context,
            resource_type,
            permissions,
        }))
    }

    pub fn matches_resource(&self, resource_type: &str) -> bool {
        match &self.resource_type {
            ResourceType::Wildcard => true,
            ResourceType::Specific(rt) => rt == resource_type,
        }
    }

    pub fn grants(&self, context: ScopeContext, resource_type: &str, permission: char) -> bool {
        self.context == context
            && self.matches_resource(resource_type)
            && self.permissions.has(permission)
    }
}

/// The full set of scopes granted to one token, already filtered to resource scopes.
#[derive(Debug, Clone, Default)]
pub struct SmartScopes {
    pub resource_scopes: Vec<SmartScope>,
}

impl SmartScopes {
    /// Parses a space-separated scope string. Non-resource tokens (`openid`, `launch`,
    /// `offline_access`, …) are silently dropped. A resource-shaped token with a malformed
    /// permission suffix is a hard error.
    pub fn parse(scope_string: &str) -> Result<Self, ScopeError> {
        let mut resource_scopes = Vec::new();
        for token in scope_string.split_whitespace() {
            if let Some(scope) = SmartScope::parse_token(token)? {
                resource_scopes.push(scope);
            }
        }
        Ok(Self { resource_scopes })
    }

    pub fn grants(&self, context: ScopeContext, resource_type: &str, permission: char) -> bool {
        self.resource_scopes
            .iter()
            .any(|s| s.grants(context, resource_type, permission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ordered_permission_subset() {
        let p = Permissions::from_str("crus").unwrap();
        assert!(p.create && p.read && p.update && !p.delete && p.search);
    }

    #[test]
    fn rejects_out_of_order_permissions() {
        assert!(matches!(
            Permissions::from_str("rc"),
            Err(ScopeError::InvalidPermissionOrder)
        ));
    }

    #[test]
    fn shorthand_permissions_expand() {
        assert_eq!(Permissions::from_str("*").unwrap(), Permissions::full());
        assert_eq!(
            Permissions::from_str("read").unwrap(),
            Permissions::read_shorthand()
        );
        assert_eq!(
            Permissions::from_str("write").unwrap(),
            Permissions::write_shorthand()
        );
    }

    #[test]
    fn non_resource_tokens_are_silently_skipped() {
        let scopes = SmartScopes::parse("openid launch fhirUser offline_access").unwrap();
        assert!(scopes.resource_scopes.is_empty());
    }

    #[test]
    fn malformed_permission_on_matching_token_is_a_hard_error() {
        // principal/type. shape matches, but "dc" is out of order.
        assert!(SmartScopes::parse("patient/Patient.dc").is_err());
    }

    #[test]
    fn grammar_mismatch_is_not_an_error() {
        // "patient/Patient" with no "." at all — not a recognized resource-scope shape.
        assert!(SmartScopes::parse("patient/Patient").unwrap().resource_scopes.is_empty());
    }

    #[test]
    fn grants_checks_context_type_and_permission() {
        let scopes = SmartScopes::parse("patient/Observation.rs patient/Patient.r").unwrap();
        assert!(scopes.grants(ScopeContext::Patient, "Observation", 'r'));
        assert!(scopes.grants(ScopeContext::Patient, "Observation", 's'));
        assert!(!scopes.grants(ScopeContext::Patient, "Observation", 'c'));
        assert!(scopes.grants(ScopeContext::Patient, "Patient", 'r'));
        assert!(!scopes.grants(ScopeContext::User, "Patient", 'r'));
    }

    #[test]
    fn wildcard_resource_type_matches_any() {
        let scopes = SmartScopes::parse("user/*.read").unwrap();
        assert!(scopes.grants(ScopeContext::User, "Encounter", 'r'));
        assert!(scopes.grants(ScopeContext::User, "Encounter", 's'));
    }
}

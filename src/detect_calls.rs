//! Dispatch of known standard-library entries by address (spec §4.7).
//!
//! Populated once, at single-threaded startup, by looking up each known
//! name in the dynamic symbol table; reads afterwards are lock-free (a
//! plain `HashMap` behind a shared reference, never mutated again).

use std::collections::HashMap;

/// Identifiers for the closed set of standard-library functions this tracer
/// knows how to intercept (spec §4.13 catalogue).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdFunctionId {
    Memcpy,
    Memmove,
    Memset,
    Strlen,
    Strcpy,
    Strncpy,
    Strcat,
    Strncat,
    Strcmp,
    Strncmp,
    Strchr,
    Strstr,
    Malloc,
    Calloc,
    Realloc,
    Free,
    Atoi,
    Atol,
    Strtol,
    Getenv,
    Fopen,
    Fclose,
    Fread,
    Fwrite,
    Fgets,
    Fputs,
    Printf,
    Fprintf,
    Sprintf,
    Snprintf,
    Scanf,
    Fscanf,
    Sscanf,
    Opendir,
    Readdir,
    Closedir,
    Read,
    Write,
    Close,
    Localeconv,
    Setlocale,
    Strerror,
    ErrnoLocation,
}

impl StdFunctionId {
    /// The symbol name looked up in the dynamic symbol table at startup.
    pub fn symbol_name(self) -> &'static str {
        use StdFunctionId::*;
        match self {
            Memcpy => "memcpy",
            Memmove => "memmove",
            Memset => "memset",
            Strlen => "strlen",
            Strcpy => "strcpy",
            Strncpy => "strncpy",
            Strcat => "strcat",
            Strncat => "strncat",
            Strcmp => "strcmp",
            Strncmp => "strncmp",
            Strchr => "strchr",
            Strstr => "strstr",
            Malloc => "malloc",
            Calloc => "calloc",
            Realloc => "realloc",
            Free => "free",
            Atoi => "atoi",
            Atol => "atol",
            Strtol => "strtol",
            Getenv => "getenv",
            Fopen => "fopen",
            Fclose => "fclose",
            Fread => "fread",
            Fwrite => "fwrite",
            Fgets => "fgets",
            Fputs => "fputs",
            Printf => "printf",
            Fprintf => "fprintf",
            Sprintf => "sprintf",
            Snprintf => "snprintf",
            Scanf => "scanf",
            Fscanf => "fscanf",
            Sscanf => "sscanf",
            Opendir => "opendir",
            Readdir => "readdir",
            Closedir => "closedir",
            Read => "read",
            Write => "write",
            Close => "close",
            Localeconv => "localeconv",
            Setlocale => "setlocale",
            Strerror => "strerror",
            ErrnoLocation => "__errno_location",
        }
    }

    /// All known identifiers, in the order `DetectCallsLookup::populate`
    /// resolves their addresses.
    pub fn all() -> &'static [StdFunctionId] {
        use StdFunctionId::*;
        &[
            Memcpy, Memmove, Memset, Strlen, Strcpy, Strncpy, Strcat, Strncat, Strcmp, Strncmp,
            Strchr, Strstr, Malloc, Calloc, Realloc, Free, Atoi, Atol, Strtol, Getenv, Fopen,
            Fclose, Fread, Fwrite, Fgets, Fputs, Printf, Fprintf, Sprintf, Snprintf, Scanf,
            Fscanf, Sscanf, Opendir, Readdir, Closedir, Read, Write, Close, Localeconv,
            Setlocale, Strerror, ErrnoLocation,
        ]
    }
}

/// A symbol resolver the detector asks to map a name to an address at
/// startup. In production this is backed by the dynamic symbol table; tests
/// supply a fixed map.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// Registry mapping known function addresses to `StdFunctionId`s.
#[derive(Default)]
pub struct DetectCallsLookup {
    by_address: HashMap<u64, StdFunctionId>,
    by_id: HashMap<StdFunctionId, u64>,
}

impl DetectCallsLookup {
    pub fn new() -> Self {
        DetectCallsLookup::default()
    }

    /// Resolves every known name via `resolver`, recording the address when
    /// present. Called only during single-threaded startup (spec §4.7).
    pub fn populate(&mut self, resolver: &dyn SymbolResolver) {
        for &id in StdFunctionId::all() {
            if let Some(addr) = resolver.resolve(id.symbol_name()) {
                self.by_address.insert(addr, id);
                self.by_id.insert(id, addr);
            }
        }
    }

    /// Returns the identifier registered for `addr`, if any.
    pub fn check(&self, addr: u64) -> Option<StdFunctionId> {
        self.by_address.get(&addr).copied()
    }

    /// Whether `addr` is the address registered for `id`.
    pub fn check_id(&self, id: StdFunctionId, addr: u64) -> bool {
        self.by_id.get(&id) == Some(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(HashMap<&'static str, u64>);
    impl SymbolResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Option<u64> {
            self.0.get(name).copied()
        }
    }

    #[test]
    fn unresolved_symbols_are_simply_absent() {
        let resolver = FixedResolver(HashMap::from([("malloc", 0x1000)]));
        let mut lookup = DetectCallsLookup::new();
        lookup.populate(&resolver);
        assert_eq!(lookup.check(0x1000), Some(StdFunctionId::Malloc));
        assert_eq!(lookup.check(0x2000), None);
        assert!(lookup.check_id(StdFunctionId::Malloc, 0x1000));
        assert!(!lookup.check_id(StdFunctionId::Free, 0x1000));
    }
}

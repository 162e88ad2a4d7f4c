use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use std::rc::Rc;

use anyhow::Result;

struct GoFlag {
    desc: &'static str,
    default_repr: String,
    is_boolean: bool,
    setter: Box<dyn Fn(&str) -> Result<()>>,
}

/// Handle to the value of a registered flag, readable after parsing.
pub struct FlagValue<T> {
    r: Rc<RefCell<T>>,
    set: Rc<Cell<bool>>,
}

impl<T: Clone> FlagValue<T> {
    pub fn get(&self) -> T {
        self.r.borrow().clone()
    }

    /// Whether the flag appeared on the command line.
    pub fn is_set(&self) -> bool {
        self.set.get()
    }
}

/// Command line parser following the conventions of Go's `flag` package:
/// `-name value`, `--name value`, `-name=value`, and bare `-name` for
/// booleans.
pub struct GoFlagSet {
    flags: BTreeMap<&'static str, GoFlag>,
    aliases: HashMap<&'static str, &'static str>,
}

impl GoFlagSet {
    pub fn new() -> Self {
        GoFlagSet {
            flags: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn parse_args(&self, mut args: impl Iterator<Item = String>) -> Result<()> {
        let mut parsed_flags = HashSet::new();

        while let Some(arg) = args.next() {
            let arg = arg
                .as_str()
                .strip_prefix("--")
                .or_else(|| arg.strip_prefix('-'))
                .ok_or_else(|| anyhow::anyhow!("Expected an option, but got {}", arg))?;

            let (name, maybe_value) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };
            let name = self.aliases.get(name).copied().unwrap_or(name);

            let flag = self
                .flags
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown flag: {}", name))?;

            anyhow::ensure!(
                parsed_flags.insert(name.to_owned()),
                "The flag {} was provided twice",
                name,
            );

            let value = match maybe_value {
                Some(value) => value.to_owned(),
                None if flag.is_boolean => "1".to_owned(),
                None => args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Value is missing for flag {}", name))?,
            };

            (flag.setter)(value.as_ref())
                .map_err(|err| anyhow::anyhow!("Invalid value {:?} for flag -{}: {}", value, name, err))?;
        }

        Ok(())
    }

    /// Makes `alias` an alternative spelling of the already registered `name`.
    pub fn alias(&mut self, alias: &'static str, name: &'static str) {
        debug_assert!(self.flags.contains_key(name));
        self.aliases.insert(alias, name);
    }

    /// Flag listing in the format printed by `-help`.
    pub fn usage(&self) -> String {
        let mut aliases_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (alias, name) in &self.aliases {
            aliases_of.entry(name).or_default().push(alias);
        }

        let mut out = String::new();
        for (name, flag) in &self.flags {
            let _ = write!(out, "  -{}", name);
            if let Some(aliases) = aliases_of.get_mut(name) {
                aliases.sort_unstable();
                for alias in aliases.iter() {
                    let _ = write!(out, ", -{}", alias);
                }
            }
            let _ = write!(out, "\n    \t{}", flag.desc);
            if !flag.default_repr.is_empty() {
                let _ = write!(out, " (default {})", flag.default_repr);
            }
            out.push('\n');
        }
        out
    }

    pub fn bool_var(
        &mut self,
        name: &'static str,
        default: bool,
        desc: &'static str,
    ) -> FlagValue<bool> {
        let repr = if default { "true" } else { "" };
        self.add_flag(name, true, default, repr.to_owned(), desc, move |s| match s {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
            _ => Err(anyhow::anyhow!("Invalid value for bool flag: {}", s)),
        })
    }

    pub fn string_var(
        &mut self,
        name: &'static str,
        default: impl ToString,
        desc: &'static str,
    ) -> FlagValue<String> {
        let default = default.to_string();
        let repr = if default.is_empty() {
            String::new()
        } else {
            format!("{:?}", default)
        };
        self.add_flag(name, false, default, repr, desc, |s| Ok(s.to_string()))
    }

    pub fn u64_var(
        &mut self,
        name: &'static str,
        default: u64,
        desc: &'static str,
    ) -> FlagValue<u64> {
        self.add_flag(name, false, default, default.to_string(), desc, |s| {
            Ok(s.parse()?)
        })
    }

    pub fn f64_var(
        &mut self,
        name: &'static str,
        default: f64,
        desc: &'static str,
    ) -> FlagValue<f64> {
        self.add_flag(name, false, default, default.to_string(), desc, |s| {
            Ok(s.parse()?)
        })
    }

    pub fn var<T: Clone + 'static>(
        &mut self,
        name: &'static str,
        default: T,
        default_repr: &'static str,
        desc: &'static str,
        converter: impl Fn(&str) -> Result<T> + 'static,
    ) -> FlagValue<T> {
        self.add_flag(
            name,
            false,
            default,
            default_repr.to_owned(),
            desc,
            converter,
        )
    }

    fn add_flag<T: Clone + 'static>(
        &mut self,
        name: &'static str,
        is_boolean: bool,
        default: T,
        default_repr: String,
        desc: &'static str,
        parser: impl Fn(&str) -> Result<T> + 'static,
    ) -> FlagValue<T> {
        let target = Rc::new(RefCell::new(default));
        let set = Rc::new(Cell::new(false));
        let target_for_parser = target.clone();
        let set_for_parser = set.clone();
        self.flags.insert(
            name,
            GoFlag {
                desc,
                default_repr,
                is_boolean,
                setter: Box::new(move |s| {
                    target_for_parser.replace(parser(s)?);
                    set_for_parser.set(true);
                    Ok(())
                }),
            },
        );
        FlagValue { r: target, set }
    }
}

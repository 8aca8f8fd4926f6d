use std::collections::{HashMap, HashSet};

use log::warn;

use crate::core::{OrmError, Result};

use super::{ArgType, InstantiationArgument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantiationTarget {
    /// Arguments collected into a list; aliases are ignored
    List,
    /// Arguments keyed by alias; every argument needs one
    Map,
    /// A registered class, through a constructor or field injection
    Class(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub ty: ArgType,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, ty: ArgType) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstructorDescriptor {
    pub parameters: Vec<ParameterDescriptor>,
}

/// Instantiable result class: its constructors and injectable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDescriptor {
    pub name: String,
    pub constructors: Vec<ConstructorDescriptor>,
    pub fields: Vec<ParameterDescriptor>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructors: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn constructor(mut self, parameters: Vec<ParameterDescriptor>) -> Self {
        self.constructors.push(ConstructorDescriptor { parameters });
        self
    }

    pub fn field(mut self, name: &str, ty: ArgType) -> Self {
        self.fields.push(ParameterDescriptor::new(name, ty));
        self
    }

    /// Best constructor for `arguments`; ties go to the first declared.
    pub fn resolve_constructor(&self, arguments: &[ArgType]) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (index, constructor) in self.constructors.iter().enumerate() {
            if constructor.parameters.len() != arguments.len() {
                continue;
            }
            let score = arguments
                .iter()
                .zip(&constructor.parameters)
                .map(|(argument, parameter)| argument.score_against(&parameter.ty))
                .sum::<Option<u32>>();
            if let Some(score) = score {
                if best.is_none_or(|(_, best_score)| score > best_score) {
                    best = Some((index, score));
                }
            }
        }
        best.map(|(index, _)| index)
    }
}

/// Registered result classes, owned by the session factory.
#[derive(Debug, Clone, Default)]
pub struct InstantiationRegistry {
    classes: HashMap<String, ClassDescriptor>,
}

/// How an instantiation builds its value once validated.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledInstantiation {
    List,
    Map { keys: Vec<String> },
    Constructor { type_name: String, names: Vec<String> },
    Injection { type_name: String, fields: Vec<String>, targets: Vec<String> },
}

impl InstantiationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassDescriptor) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn class(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.get(name)
    }

    /// Validate an instantiation before any statement runs.
    pub fn compile(&self, target: &InstantiationTarget, arguments: &[InstantiationArgument]) -> Result<CompiledInstantiation> {
        match target {
            InstantiationTarget::List => {
                if arguments.iter().any(|a| a.alias.is_some()) {
                    warn!("Argument aliases of a list instantiation are ignored");
                }
                Ok(CompiledInstantiation::List)
            }
            InstantiationTarget::Map => Ok(CompiledInstantiation::Map {
                keys: unique_aliases("map", arguments)?,
            }),
            InstantiationTarget::Class(name) => {
                let class = self.classes.get(name).ok_or_else(|| {
                    OrmError::QueryCompilation(format!("Unknown instantiation target class '{}'", name))
                })?;
                let types: Vec<ArgType> = arguments.iter().map(|a| a.result.result_type()).collect();
                if let Some(index) = class.resolve_constructor(&types) {
                    return Ok(CompiledInstantiation::Constructor {
                        type_name: class.name.clone(),
                        names: class.constructors[index]
                            .parameters
                            .iter()
                            .map(|p| p.name.clone())
                            .collect(),
                    });
                }

                let aliases = unique_aliases(name, arguments).map_err(|e| match e {
                    OrmError::QueryCompilation(message) => OrmError::QueryCompilation(format!(
                        "No constructor of {} matches ({}); field injection failed: {}",
                        name,
                        types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                        message
                    )),
                    other => other,
                })?;
                for (alias, ty) in aliases.iter().zip(&types) {
                    let field = class.fields.iter().find(|f| &f.name == alias).ok_or_else(|| {
                        OrmError::QueryCompilation(format!("{} has no field or setter named '{}'", name, alias))
                    })?;
                    if ty.score_against(&field.ty).is_none() {
                        return Err(OrmError::QueryCompilation(format!(
                            "Field {}.{} of type {} cannot take a {}",
                            name, alias, field.ty, ty
                        )));
                    }
                }
                Ok(CompiledInstantiation::Injection {
                    type_name: class.name.clone(),
                    fields: class.fields.iter().map(|f| f.name.clone()).collect(),
                    targets: aliases,
                })
            }
        }
    }
}

fn unique_aliases(target: &str, arguments: &[InstantiationArgument]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut aliases = Vec::with_capacity(arguments.len());
    for (position, argument) in arguments.iter().enumerate() {
        let alias = argument.alias.as_ref().ok_or_else(|| {
            OrmError::QueryCompilation(format!(
                "Argument {} of the {} instantiation has no alias",
                position, target
            ))
        })?;
        if !seen.insert(alias.as_str()) {
            return Err(OrmError::QueryCompilation(format!(
                "Alias '{}' is used twice in the {} instantiation",
                alias, target
            )));
        }
        aliases.push(alias.clone());
    }
    Ok(aliases)
}

use crate::stack::value::{Value, VarType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration of a stack: variables, module definitions, instances and outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDef>,
    /// Declaration order is significant: it breaks ties in the apply order
    #[serde(default)]
    pub instances: Vec<InstanceDecl>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(rename = "type", default)]
    pub type_: VarType,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl VariableDecl {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Reusable module definition. `kind` selects the resource provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDef {
    pub kind: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDecl {
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// A module bound to input expressions at one call site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDecl {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl InstanceDecl {
    pub fn address(&self) -> String {
        instance_address(&self.name)
    }
}

/// State address of an instance
pub fn instance_address(name: &str) -> String {
    format!("module.{}", name)
}

impl StackConfig {
    pub fn module_for(&self, instance: &InstanceDecl) -> Option<&ModuleDef> {
        self.modules.get(&instance.module)
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceDecl> {
        self.instances.iter().find(|i| i.name == name)
    }
}

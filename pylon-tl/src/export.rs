//! Schema export: the JSON layout Telegram publishes and canonical TL text.

use serde::{Deserialize, Serialize};

use crate::schema::{Schema, Shape};

/// `{constructors: [...], methods: [...]}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaJson {
    pub constructors: Vec<ConstructorJson>,
    pub methods: Vec<MethodJson>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstructorJson {
    /// Signed decimal, as in Telegram's published schema.
    pub id: String,
    pub predicate: String,
    pub params: Vec<ParamJson>,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodJson {
    pub id: String,
    pub method: String,
    pub params: Vec<ParamJson>,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamJson {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

fn params(shape: &Shape) -> Vec<ParamJson> {
    let mut out = Vec::with_capacity(shape.fields.len() + 1);
    if let Some(flags) = &shape.flags {
        out.push(ParamJson { name: flags.clone(), ty: "#".into() });
    }
    for field in &shape.fields {
        let ty = match (field.flag, &shape.flags) {
            (Some(bit), Some(flags)) => format!("{flags}.{bit}?{}", field.ty),
            _ => field.ty.to_string(),
        };
        out.push(ParamJson { name: field.name.clone(), ty });
    }
    out
}

impl Schema {
    pub fn to_json(&self) -> SchemaJson {
        SchemaJson {
            constructors: self
                .combinators()
                .iter()
                .map(|c| ConstructorJson {
                    id: (c.id as i32).to_string(),
                    predicate: c.name.clone(),
                    params: params(&c.shape),
                    ty: c.boxed_type.clone(),
                })
                .collect(),
            methods: self
                .functions()
                .iter()
                .map(|f| MethodJson {
                    id: (f.id as i32).to_string(),
                    method: f.name.clone(),
                    params: params(&f.shape),
                    ty: f.returns.to_string(),
                })
                .collect(),
        }
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.to_json())
    }

    /// Constructors, a `---functions---` line, then functions; one
    /// `name#id params = Type;` per line.
    pub fn to_tl(&self) -> String {
        let mut out = String::new();
        for c in self.combinators() {
            out.push_str(&format!("{c};\n"));
        }
        out.push_str("\n---functions---\n\n");
        for f in self.functions() {
            out.push_str(&format!("{f};\n"));
        }
        out
    }
}

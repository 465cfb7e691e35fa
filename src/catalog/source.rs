//! Syntax-tree view over a lesson script, built with tree-sitter.
//!
//! Nothing here executes the script; every query walks the parsed tree.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Number, Value};
use tree_sitter::{Node, Parser, Tree};

/// Nested containers deeper than this are not carried as globals.
const MAX_LITERAL_DEPTH: usize = 32;

/// A literal (or literal-ish) expression found in the source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(String),
    Bool(bool),
    None,
    List,
    Dict,
    /// Anything else, kept as raw source text.
    Expr(String),
}

impl Literal {
    /// Text used as a catalog default: quoted contents verbatim, `None` as empty,
    /// booleans lower-cased, other expressions as written.
    pub fn default_text(&self) -> String {
        match self {
            Literal::Str(s) | Literal::Number(s) | Literal::Expr(s) => s.clone(),
            Literal::Bool(b) => b.to_string(),
            Literal::None | Literal::List | Literal::Dict => String::new(),
        }
    }
}

/// One `parser.add_argument(...)` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArgumentCall {
    pub flags: Vec<String>,
    pub keywords: BTreeMap<String, Literal>,
}

impl ArgumentCall {
    pub fn keyword(&self, name: &str) -> Option<&Literal> {
        self.keywords.get(name)
    }
}

/// Shape of a module-level `get_agent` definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub required_params: usize,
    pub total_params: usize,
    pub variadic: bool,
}

impl EntryPoint {
    /// Callable as `get_agent()` or `get_agent(model=...)`.
    pub fn is_usable(&self) -> bool {
        self.required_params <= 1
    }

    pub fn accepts_model(&self) -> bool {
        self.total_params > 0 || self.variadic
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub docstring: String,
    pub fields: Vec<SchemaField>,
}

/// What a script imports, split the way the catalog presents it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImportSummary {
    /// Names pulled from `agno` outside its tools package, plus `pydantic`.
    #[serde(default)]
    pub agno_features: Vec<String>,
    /// Names pulled from `agno.tools.*`.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Top-level packages of every other import.
    #[serde(default)]
    pub external: Vec<String>,
}

pub struct ScriptSource {
    text: String,
    tree: Tree,
}

impl ScriptSource {
    pub fn parse(text: impl Into<String>) -> Result<Self, String> {
        let text = text.into();
        let mut parser = Parser::new();
        parser
            .set_language(tree_sitter_python::language())
            .map_err(|e| format!("Failed to set Python language: {:?}", e))?;
        let tree = parser
            .parse(&text, None)
            .ok_or_else(|| "Failed to parse source code".to_string())?;
        Ok(Self { text, tree })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 1-based line of the first syntax error, if any.
    pub fn syntax_error_line(&self) -> Option<usize> {
        let root = self.tree.root_node();
        if !root.has_error() {
            return None;
        }
        let mut line = None;
        visit(root, &mut |node| {
            if line.is_none() && (node.is_error() || node.is_missing()) {
                line = Some(node.start_position().row + 1);
            }
        });
        line.or(Some(1))
    }

    /// The module docstring, cleaned of common indentation.
    pub fn docstring(&self) -> Option<String> {
        let root = self.tree.root_node();
        let first = named_children(root)
            .into_iter()
            .find(|node| node.kind() != "comment")?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let expr = first.named_child(0)?;
        let raw = self.string_value(expr)?;
        Some(clean_doc(&raw))
    }

    pub fn argument_calls(&self) -> Vec<ArgumentCall> {
        let mut calls = Vec::new();
        visit(self.tree.root_node(), &mut |node| {
            if node.kind() != "call" {
                return;
            }
            let Some(function) = node.child_by_field_name("function") else {
                return;
            };
            let is_add_argument = function.kind() == "attribute"
                && function
                    .child_by_field_name("attribute")
                    .is_some_and(|attr| self.node_text(attr) == "add_argument");
            if !is_add_argument {
                return;
            }
            let Some(arguments) = node.child_by_field_name("arguments") else {
                return;
            };
            let mut call = ArgumentCall::default();
            for arg in named_children(arguments) {
                match arg.kind() {
                    "keyword_argument" => {
                        let (Some(name), Some(value)) = (
                            arg.child_by_field_name("name"),
                            arg.child_by_field_name("value"),
                        ) else {
                            continue;
                        };
                        call.keywords
                            .insert(self.node_text(name).to_string(), self.literal(value));
                    }
                    _ => {
                        if let Some(flag) = self.string_value(arg) {
                            call.flags.push(flag);
                        }
                    }
                }
            }
            if !call.flags.is_empty() {
                calls.push(call);
            }
        });
        calls
    }

    /// Entries of a top-level `DEFAULT_CONFIG = {...}` dict literal, in source order.
    pub fn default_config(&self) -> Vec<(String, Literal)> {
        let Some(dict) = self
            .top_level_assignments()
            .into_iter()
            .find(|(name, value)| name == "DEFAULT_CONFIG" && value.kind() == "dictionary")
            .map(|(_, value)| value)
        else {
            return Vec::new();
        };
        named_children(dict)
            .into_iter()
            .filter(|pair| pair.kind() == "pair")
            .filter_map(|pair| {
                let key = self.string_value(pair.child_by_field_name("key")?)?;
                let value = self.literal(pair.child_by_field_name("value")?);
                Some((key, value))
            })
            .collect()
    }

    /// Module-level names bound to JSON-representable literals.
    pub fn literal_globals(&self) -> BTreeMap<String, Value> {
        self.top_level_assignments()
            .into_iter()
            .filter_map(|(name, value)| Some((name, self.json_literal(value, 0)?)))
            .collect()
    }

    pub fn entry_point(&self, name: &str) -> Option<EntryPoint> {
        let root = self.tree.root_node();
        for stmt in named_children(root) {
            let def = match stmt.kind() {
                "function_definition" => stmt,
                "decorated_definition" => match stmt.child_by_field_name("definition") {
                    Some(def) if def.kind() == "function_definition" => def,
                    _ => continue,
                },
                _ => continue,
            };
            let matches = def
                .child_by_field_name("name")
                .is_some_and(|n| self.node_text(n) == name);
            if !matches {
                continue;
            }
            let mut entry = EntryPoint {
                required_params: 0,
                total_params: 0,
                variadic: false,
            };
            if let Some(params) = def.child_by_field_name("parameters") {
                for param in named_children(params) {
                    match param.kind() {
                        "identifier" | "typed_parameter" => {
                            entry.required_params += 1;
                            entry.total_params += 1;
                        }
                        "default_parameter" | "typed_default_parameter" => {
                            entry.total_params += 1;
                        }
                        "list_splat_pattern" | "dictionary_splat_pattern" => {
                            entry.variadic = true;
                        }
                        _ => {}
                    }
                }
            }
            return Some(entry);
        }
        // `get_agent = make_agent` style bindings: arity unknown, assume the model form.
        self.top_level_assignments()
            .into_iter()
            .any(|(bound, _)| bound == name)
            .then_some(EntryPoint {
                required_params: 0,
                total_params: 1,
                variadic: false,
            })
    }

    /// Classes deriving from pydantic's `BaseModel`.
    pub fn output_schemas(&self) -> Vec<OutputSchema> {
        let mut schemas = Vec::new();
        visit(self.tree.root_node(), &mut |node| {
            if node.kind() != "class_definition" {
                return;
            }
            let derives_base_model = node
                .child_by_field_name("superclasses")
                .map(|supers| {
                    named_children(supers).into_iter().any(|base| {
                        let text = self.node_text(base);
                        text == "BaseModel" || text.ends_with(".BaseModel")
                    })
                })
                .unwrap_or(false);
            if !derives_base_model {
                return;
            }
            let Some(name) = node.child_by_field_name("name") else {
                return;
            };
            let mut schema = OutputSchema {
                name: self.node_text(name).to_string(),
                docstring: String::new(),
                fields: Vec::new(),
            };
            if let Some(body) = node.child_by_field_name("body") {
                for (idx, stmt) in named_children(body).into_iter().enumerate() {
                    if stmt.kind() != "expression_statement" {
                        continue;
                    }
                    let Some(inner) = stmt.named_child(0) else {
                        continue;
                    };
                    if idx == 0 {
                        if let Some(doc) = self.string_value(inner) {
                            schema.docstring = clean_doc(&doc);
                            continue;
                        }
                    }
                    if let Some(field) = self.schema_field(inner) {
                        schema.fields.push(field);
                    }
                }
            }
            schemas.push(schema);
        });
        schemas
    }

    /// Every `import` / `from ... import` in the file, nested ones included.
    pub fn imports(&self) -> ImportSummary {
        let mut features = BTreeSet::new();
        let mut tools = BTreeSet::new();
        let mut external = BTreeSet::new();
        visit(self.tree.root_node(), &mut |node| match node.kind() {
            "import_statement" => {
                for name in self.imported_names(node) {
                    if let Some(top) = name.split('.').next().filter(|t| !t.is_empty()) {
                        external.insert(top.to_string());
                    }
                }
            }
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|m| self.node_text(m).to_string())
                    .unwrap_or_default();
                if module.starts_with("agno") {
                    let target = if module.contains("tools") { &mut tools } else { &mut features };
                    target.extend(self.imported_names(node));
                } else if module.starts_with("pydantic") {
                    features.insert("pydantic".to_string());
                } else if let Some(top) = module.split('.').next().filter(|t| !t.is_empty()) {
                    external.insert(top.to_string());
                }
            }
            _ => {}
        });
        ImportSummary {
            agno_features: features.into_iter().collect(),
            tools: tools.into_iter().collect(),
            external: external.into_iter().collect(),
        }
    }

    /// The original (un-aliased) names listed by an import statement.
    fn imported_names(&self, stmt: Node) -> Vec<String> {
        let mut cursor = stmt.walk();
        let names: Vec<Node> = stmt.children_by_field_name("name", &mut cursor).collect();
        names
            .into_iter()
            .filter_map(|name| match name.kind() {
                "aliased_import" => name.child_by_field_name("name"),
                _ => Some(name),
            })
            .map(|name| self.node_text(name).to_string())
            .collect()
    }

    fn schema_field(&self, assignment: Node) -> Option<SchemaField> {
        if assignment.kind() != "assignment" {
            return None;
        }
        let left = assignment.child_by_field_name("left")?;
        let annotation = assignment.child_by_field_name("type")?;
        if left.kind() != "identifier" {
            return None;
        }
        let description = assignment
            .child_by_field_name("right")
            .filter(|right| right.kind() == "call")
            .and_then(|call| call.child_by_field_name("arguments"))
            .and_then(|args| {
                named_children(args).into_iter().find_map(|kw| {
                    if kw.kind() != "keyword_argument" {
                        return None;
                    }
                    let name = kw.child_by_field_name("name")?;
                    if self.node_text(name) != "description" {
                        return None;
                    }
                    self.string_value(kw.child_by_field_name("value")?)
                })
            })
            .unwrap_or_default();
        Some(SchemaField {
            name: self.node_text(left).to_string(),
            type_name: self.node_text(annotation).to_string(),
            description,
        })
    }

    fn top_level_assignments(&self) -> Vec<(String, Node<'_>)> {
        named_children(self.tree.root_node())
            .into_iter()
            .filter(|stmt| stmt.kind() == "expression_statement")
            .filter_map(|stmt| stmt.named_child(0))
            .filter(|expr| expr.kind() == "assignment")
            .filter_map(|assignment| {
                let left = assignment.child_by_field_name("left")?;
                let right = assignment.child_by_field_name("right")?;
                (left.kind() == "identifier").then(|| (self.node_text(left).to_string(), right))
            })
            .collect()
    }

    fn node_text(&self, node: Node) -> &str {
        &self.text[node.byte_range()]
    }

    fn string_value(&self, node: Node) -> Option<String> {
        match node.kind() {
            "string" => Some(decode_string_literal(self.node_text(node))),
            "concatenated_string" => Some(
                named_children(node)
                    .into_iter()
                    .filter(|part| part.kind() == "string")
                    .map(|part| decode_string_literal(self.node_text(part)))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn literal(&self, node: Node) -> Literal {
        if let Some(s) = self.string_value(node) {
            return Literal::Str(s);
        }
        match node.kind() {
            "integer" | "float" => Literal::Number(self.node_text(node).to_string()),
            "true" => Literal::Bool(true),
            "false" => Literal::Bool(false),
            "none" => Literal::None,
            "list" | "tuple" => Literal::List,
            "dictionary" => Literal::Dict,
            _ => Literal::Expr(self.node_text(node).to_string()),
        }
    }

    fn json_literal(&self, node: Node, depth: usize) -> Option<Value> {
        if depth > MAX_LITERAL_DEPTH {
            return None;
        }
        if let Some(s) = self.string_value(node) {
            return Some(Value::String(s));
        }
        match node.kind() {
            "integer" => self.node_text(node).replace('_', "").parse::<i64>().ok().map(Value::from),
            "float" => self
                .node_text(node)
                .replace('_', "")
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            "none" => Some(Value::Null),
            "list" | "tuple" => named_children(node)
                .into_iter()
                .map(|item| self.json_literal(item, depth + 1))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            "dictionary" => {
                let mut map = Map::new();
                for pair in named_children(node) {
                    if pair.kind() != "pair" {
                        return None;
                    }
                    let key = self.string_value(pair.child_by_field_name("key")?)?;
                    let value = self.json_literal(pair.child_by_field_name("value")?, depth + 1)?;
                    map.insert(key, value);
                }
                Some(Value::Object(map))
            }
            _ => None,
        }
    }
}

fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Pre-order walk over `node` and its descendants. Uses a cursor rather than
/// recursion, so nesting depth in the script does not touch the call stack.
fn visit<'tree>(node: Node<'tree>, f: &mut impl FnMut(Node<'tree>)) {
    let mut cursor = node.walk();
    loop {
        f(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

/// Strips the prefix and quotes of a Python string literal and resolves the common
/// escapes (raw strings are left alone).
fn decode_string_literal(raw: &str) -> String {
    let prefix_len = raw
        .find(|c: char| c == '"' || c == '\'')
        .unwrap_or(0);
    let (prefix, quoted) = raw.split_at(prefix_len);
    let is_raw = prefix.contains(['r', 'R']);
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|q| {
            quoted
                .strip_prefix(q)
                .and_then(|rest| rest.strip_suffix(q))
                .filter(|_| quoted.len() >= 2 * q.len())
        })
        .unwrap_or(quoted);
    if is_raw {
        return body.to_string();
    }
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Docstring normalisation: trim the first line, dedent the rest by their common
/// indentation, drop leading and trailing blank lines.
fn clean_doc(doc: &str) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut cleaned: Vec<String> = lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            if idx == 0 || line.trim().is_empty() {
                line.trim().to_string()
            } else {
                line.get(indent..)
                    .map(str::trim_end)
                    .unwrap_or_else(|| line.trim())
                    .to_string()
            }
        })
        .collect();
    while cleaned.first().is_some_and(|l| l.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

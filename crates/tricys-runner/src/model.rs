//! Structural view of Modelica source: classes, component declarations and
//! `connect` equations, each carrying the byte range it came from.
//!
//! Only what the rewriter needs is modelled. Everything else (modifications,
//! ordinary equations, algorithms) is skipped token-wise and left untouched,
//! so rewrites are expressed as [`Splice`]s over the original text.

use std::ops::Range;
use thiserror::Error;

const CLASS_KINDS: &[&str] = &[
    "model", "block", "package", "connector", "record", "function", "type", "class",
];
const CLASS_PREFIXES: &[&str] = &[
    "partial",
    "encapsulated",
    "final",
    "expandable",
    "operator",
    "pure",
    "impure",
    "redeclare",
    "replaceable",
    "inner",
    "outer",
];
const COMPONENT_PREFIXES: &[&str] = &[
    "parameter",
    "constant",
    "input",
    "output",
    "flow",
    "stream",
    "discrete",
    "inner",
    "outer",
    "replaceable",
    "redeclare",
    "final",
    "each",
];

pub const REAL_INPUT: &str = "RealInput";
pub const REAL_OUTPUT: &str = "RealOutput";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str,
    Num,
    Sym(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
}

fn lex(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let start = i;
            i += 2;
            loop {
                if i + 1 >= bytes.len() {
                    return Err(error_at(src, start, "unterminated block comment"));
                }
                if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c == b'"' || c == b'\'' {
            let start = i;
            i += 1;
            loop {
                match bytes.get(i) {
                    None => return Err(error_at(src, start, "unterminated string")),
                    Some(b'\\') => i += 2,
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            // quoted identifiers behave like names
            let tok = if c == b'"' {
                Tok::Str
            } else {
                Tok::Ident(src[start..i].to_string())
            };
            out.push(Token { tok, start, end: i });
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push(Token {
                tok: Tok::Ident(src[start..i].to_string()),
                start,
                end: i,
            });
        } else if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() {
                let b = bytes[i];
                let exp_sign = (b == b'+' || b == b'-') && matches!(bytes[i - 1], b'e' | b'E');
                if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            out.push(Token {
                tok: Tok::Num,
                start,
                end: i,
            });
        } else {
            let width = src[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push(Token {
                tok: Tok::Sym(c as char),
                start: i,
                end: i + width,
            });
            i += width;
        }
    }
    Ok(out)
}

fn error_at(src: &str, offset: usize, message: impl Into<String>) -> ParseError {
    ParseError {
        line: src[..offset.min(src.len())].matches('\n').count() + 1,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// One declared component, e.g. `Modelica.Blocks.Interfaces.RealOutput y[n] "out";`.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub type_name: String,
    pub name: String,
    /// Raw dimension expressions, type dimensions first.
    pub dims: Vec<String>,
    /// Binding expression after `=`, if any.
    pub binding: Option<String>,
    pub parameter: bool,
    pub protected: bool,
    /// Whole declaration statement including the trailing `;`.
    pub span: Range<usize>,
}

impl Component {
    pub fn direction(&self) -> Option<PortDirection> {
        let last = self.type_name.rsplit('.').next().unwrap_or(&self.type_name);
        match last {
            REAL_INPUT => Some(PortDirection::Input),
            REAL_OUTPUT => Some(PortDirection::Output),
            _ => None,
        }
    }
}

/// `inst.port[idx]` as written in a `connect` equation.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRef {
    /// `None` for the enclosing class's own connectors.
    pub instance: Option<String>,
    pub port: String,
    pub index: Option<String>,
}

impl PortRef {
    pub fn refers_to(&self, instance: &str, port: &str) -> bool {
        self.instance.as_deref() == Some(instance) && self.port == port
    }

    /// Renders the same element reference on another instance and port.
    pub fn retarget(&self, instance: &str, port: &str) -> String {
        match &self.index {
            Some(idx) => format!("{}.{}[{}]", instance, port, idx),
            None => format!("{}.{}", instance, port),
        }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(inst) = &self.instance {
            write!(f, "{}.", inst)?;
        }
        f.write_str(&self.port)?;
        if let Some(idx) = &self.index {
            write!(f, "[{}]", idx)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub from: PortRef,
    pub to: PortRef,
    pub span: Range<usize>,
}

/// A resolved port: name, element count, and whether it is declared as an array.
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub dim: usize,
    pub array: bool,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub kind: String,
    pub name: String,
    /// From the first prefix keyword through `end Name;`.
    pub span: Range<usize>,
    pub name_span: Range<usize>,
    /// The name inside `end Name;`; empty for short class definitions.
    pub end_name_span: Range<usize>,
    /// Start of the `end Name;` statement.
    pub end_start: usize,
    /// Start of the first `equation` keyword.
    pub equation_start: Option<usize>,
    pub components: Vec<Component>,
    pub connections: Vec<Connection>,
    /// Class-level `annotation(...);` statements.
    pub annotations: Vec<Range<usize>>,
    pub classes: Vec<ClassDef>,
}

impl ClassDef {
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Depth-first search through nested classes, this class included.
    pub fn find(&self, name: &str) -> Option<&ClassDef> {
        if self.name == name {
            return Some(self);
        }
        self.classes.iter().find_map(|c| c.find(name))
    }

    /// `RealInput`/`RealOutput` declarations with their dimensions resolved.
    pub fn ports(&self) -> Result<Vec<Port>, String> {
        self.components
            .iter()
            .filter_map(|c| c.direction().map(|d| (c, d)))
            .map(|(c, direction)| {
                let (dim, array) = self.resolve_dims(c)?;
                Ok(Port {
                    name: c.name.clone(),
                    direction,
                    dim,
                    array,
                    span: c.span.clone(),
                })
            })
            .collect()
    }

    pub fn output_ports(&self) -> Result<Vec<Port>, String> {
        Ok(self
            .ports()?
            .into_iter()
            .filter(|p| p.direction == PortDirection::Output)
            .collect())
    }

    pub fn input_ports(&self) -> Result<Vec<Port>, String> {
        Ok(self
            .ports()?
            .into_iter()
            .filter(|p| p.direction == PortDirection::Input)
            .collect())
    }

    fn resolve_dims(&self, c: &Component) -> Result<(usize, bool), String> {
        match c.dims.as_slice() {
            [] => Ok((1, false)),
            [expr] => self.eval_dim(expr).map(|n| (n, true)).ok_or_else(|| {
                format!("cannot resolve dimension '{}' of port '{}'", expr, c.name)
            }),
            _ => Err(format!("port '{}' has more than one dimension", c.name)),
        }
    }

    fn eval_dim(&self, expr: &str) -> Option<usize> {
        let expr = expr.trim();
        if let Ok(n) = expr.parse::<usize>() {
            return Some(n);
        }
        let param = self.component(expr).filter(|c| c.parameter)?;
        param.binding.as_deref()?.trim().parse::<usize>().ok()
    }

    /// Parameters whose names appear as a port dimension.
    pub fn dimension_parameters(&self) -> Vec<&Component> {
        let used: Vec<&str> = self
            .components
            .iter()
            .filter(|c| c.direction().is_some())
            .flat_map(|c| c.dims.iter().map(|d| d.trim()))
            .collect();
        self.components
            .iter()
            .filter(|c| c.parameter && used.contains(&c.name.as_str()))
            .collect()
    }

    pub fn connections_touching(&self, instance: &str, port: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.from.refers_to(instance, port) || c.to.refers_to(instance, port))
            .collect()
    }
}

/// A parsed `.mo` file.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFile {
    pub source: String,
    pub within: Option<String>,
    pub classes: Vec<ClassDef>,
}

impl ModelFile {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = lex(source)?;
        let mut p = Parser {
            src: source,
            toks: tokens,
            pos: 0,
        };
        let within = p.parse_within();
        let mut classes = Vec::new();
        while p.pos < p.toks.len() {
            if p.looks_like_class() {
                classes.push(p.parse_class()?);
            } else {
                p.skip_statement();
            }
        }
        Ok(Self {
            source: source.to_string(),
            within,
            classes,
        })
    }

    /// Looks up a class by dotted path relative to the file's top level.
    pub fn class_path(&self, path: &str) -> Option<&ClassDef> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut cur = self.classes.iter().find(|c| c.name == first)?;
        for part in parts {
            cur = cur.class(part)?;
        }
        Some(cur)
    }

    pub fn find(&self, name: &str) -> Option<&ClassDef> {
        self.classes.iter().find_map(|c| c.find(name))
    }

    pub fn text(&self, range: &Range<usize>) -> &str {
        &self.source[range.clone()]
    }
}

struct Parser<'a> {
    src: &'a str,
    toks: Vec<Token>,
    pos: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Public,
    Protected,
    Equation,
    Algorithm,
}

impl<'a> Parser<'a> {
    fn ident_at(&self, offset: usize) -> Option<&str> {
        match self.toks.get(self.pos + offset).map(|t| &t.tok) {
            Some(Tok::Ident(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn sym_at(&self, offset: usize, c: char) -> bool {
        matches!(self.toks.get(self.pos + offset).map(|t| &t.tok), Some(Tok::Sym(s)) if *s == c)
    }

    fn start_of(&self, offset: usize) -> usize {
        self.toks
            .get(self.pos + offset)
            .map(|t| t.start)
            .unwrap_or(self.src.len())
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        error_at(self.src, self.start_of(0), message)
    }

    fn parse_within(&mut self) -> Option<String> {
        if self.ident_at(0) != Some("within") {
            return None;
        }
        self.pos += 1;
        let start = self.start_of(0);
        let end = self.skip_statement();
        let name = self.src[start..end].trim_end_matches(';').trim().to_string();
        Some(name)
    }

    /// Advances past the next `;` at bracket depth zero and returns the offset
    /// just after it.
    fn skip_statement(&mut self) -> usize {
        let mut depth = 0i32;
        while let Some(t) = self.toks.get(self.pos) {
            self.pos += 1;
            match t.tok {
                Tok::Sym('(') | Tok::Sym('[') | Tok::Sym('{') => depth += 1,
                Tok::Sym(')') | Tok::Sym(']') | Tok::Sym('}') => depth -= 1,
                Tok::Sym(';') if depth <= 0 => return t.end,
                _ => {}
            }
        }
        self.src.len()
    }

    fn looks_like_class(&self) -> bool {
        let mut i = 0;
        while let Some(word) = self.ident_at(i) {
            if word == "operator" && self.ident_at(i + 1).map(|w| CLASS_KINDS.contains(&w)) != Some(true) {
                return self.ident_at(i + 1).is_some();
            }
            if CLASS_KINDS.contains(&word) {
                return self.ident_at(i + 1).is_some();
            }
            if !CLASS_PREFIXES.contains(&word) {
                return false;
            }
            i += 1;
        }
        false
    }

    fn parse_class(&mut self) -> Result<ClassDef, ParseError> {
        let start = self.start_of(0);
        let mut kind = String::new();
        while let Some(word) = self.ident_at(0) {
            let is_kind = CLASS_KINDS.contains(&word)
                || (word == "operator" && self.ident_at(1).map(|w| CLASS_KINDS.contains(&w)) != Some(true));
            self.pos += 1;
            if is_kind {
                kind = word_owned(&self.toks[self.pos - 1]);
                break;
            }
        }
        let name_tok = self
            .toks
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("class name expected"))?;
        let Tok::Ident(name) = name_tok.tok.clone() else {
            return Err(self.error("class name expected"));
        };
        self.pos += 1;

        let mut class = ClassDef {
            kind,
            name: name.clone(),
            span: start..start,
            name_span: name_tok.start..name_tok.end,
            end_name_span: 0..0,
            end_start: 0,
            equation_start: None,
            components: Vec::new(),
            connections: Vec::new(),
            annotations: Vec::new(),
            classes: Vec::new(),
        };

        if self.sym_at(0, '=') {
            let end = self.skip_statement();
            class.span = start..end;
            class.end_start = end;
            return Ok(class);
        }

        let mut section = Section::Public;
        loop {
            if self.pos >= self.toks.len() {
                return Err(error_at(self.src, start, format!("class '{}' is not terminated", name)));
            }
            if self.ident_at(0) == Some("end") && self.ident_at(1) == Some(name.as_str()) && self.sym_at(2, ';') {
                class.end_start = self.start_of(0);
                let end_name = &self.toks[self.pos + 1];
                class.end_name_span = end_name.start..end_name.end;
                class.span = start..self.toks[self.pos + 2].end;
                self.pos += 3;
                return Ok(class);
            }
            match self.ident_at(0) {
                Some("public") => {
                    section = Section::Public;
                    self.pos += 1;
                    continue;
                }
                Some("protected") => {
                    section = Section::Protected;
                    self.pos += 1;
                    continue;
                }
                Some("initial") if matches!(self.ident_at(1), Some("equation") | Some("algorithm")) => {
                    section = if self.ident_at(1) == Some("equation") {
                        Section::Equation
                    } else {
                        Section::Algorithm
                    };
                    self.pos += 2;
                    continue;
                }
                Some("equation") => {
                    class.equation_start.get_or_insert(self.start_of(0));
                    section = Section::Equation;
                    self.pos += 1;
                    continue;
                }
                Some("algorithm") => {
                    section = Section::Algorithm;
                    self.pos += 1;
                    continue;
                }
                Some("annotation") => {
                    let s = self.start_of(0);
                    let e = self.skip_statement();
                    class.annotations.push(s..e);
                    continue;
                }
                _ => {}
            }
            if matches!(self.toks[self.pos].tok, Tok::Str) {
                // class description string
                self.pos += 1;
                continue;
            }
            match section {
                Section::Equation => {
                    if self.ident_at(0) == Some("connect") {
                        if let Some(conn) = self.parse_connect() {
                            class.connections.push(conn);
                        }
                    } else {
                        self.skip_statement();
                    }
                }
                Section::Algorithm => {
                    self.skip_statement();
                }
                Section::Public | Section::Protected => {
                    if self.looks_like_class() {
                        class.classes.push(self.parse_class()?);
                    } else if matches!(self.ident_at(0), Some("extends") | Some("import")) {
                        self.skip_statement();
                    } else {
                        let protected = section == Section::Protected;
                        class.components.extend(self.parse_components(protected));
                    }
                }
            }
        }
    }

    /// `connect(a.b[i], c.d);`. Returns `None` (having skipped the statement)
    /// when the arguments are not plain component references.
    fn parse_connect(&mut self) -> Option<Connection> {
        let start = self.start_of(0);
        let save = self.pos;
        self.pos += 1;
        match self.connect_args() {
            Some((from, to)) => {
                let end = self.skip_statement();
                Some(Connection {
                    from,
                    to,
                    span: start..end,
                })
            }
            None => {
                self.pos = save;
                self.skip_statement();
                None
            }
        }
    }

    fn connect_args(&mut self) -> Option<(PortRef, PortRef)> {
        if !self.sym_at(0, '(') {
            return None;
        }
        self.pos += 1;
        let from = self.parse_port_ref()?;
        if !self.sym_at(0, ',') {
            return None;
        }
        self.pos += 1;
        let to = self.parse_port_ref()?;
        if !self.sym_at(0, ')') {
            return None;
        }
        self.pos += 1;
        Some((from, to))
    }

    fn parse_port_ref(&mut self) -> Option<PortRef> {
        let mut segments: Vec<(String, Option<String>)> = Vec::new();
        loop {
            let name = self.ident_at(0)?.to_string();
            self.pos += 1;
            let subscript = if self.sym_at(0, '[') {
                Some(self.bracket_text()?)
            } else {
                None
            };
            segments.push((name, subscript));
            if self.sym_at(0, '.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let render = |(n, s): &(String, Option<String>)| match s {
            Some(s) => format!("{}[{}]", n, s),
            None => n.clone(),
        };
        let (last_name, index) = segments.pop()?;
        if segments.is_empty() {
            return Some(PortRef {
                instance: None,
                port: last_name,
                index,
            });
        }
        let instance = render(&segments[0]);
        let mut port_parts: Vec<String> = segments[1..].iter().map(render).collect();
        port_parts.push(last_name);
        Some(PortRef {
            instance: Some(instance),
            port: port_parts.join("."),
            index,
        })
    }

    /// Consumes `[ ... ]` and returns the trimmed inner text.
    fn bracket_text(&mut self) -> Option<String> {
        let open = self.toks.get(self.pos)?.end;
        let mut depth = 0;
        while let Some(t) = self.toks.get(self.pos) {
            self.pos += 1;
            match t.tok {
                Tok::Sym('[') => depth += 1,
                Tok::Sym(']') => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(self.src[open..t.start].trim().to_string());
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn split_dims(text: &str) -> Vec<String> {
        let mut dims = Vec::new();
        let mut depth = 0;
        let mut cur = String::new();
        for ch in text.chars() {
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                ',' if depth == 0 => {
                    dims.push(cur.trim().to_string());
                    cur.clear();
                    continue;
                }
                _ => {}
            }
            cur.push(ch);
        }
        if !cur.trim().is_empty() {
            dims.push(cur.trim().to_string());
        }
        dims
    }

    /// One declaration statement, possibly declaring several comma-separated
    /// components. Anything not shaped like a declaration is skipped.
    fn parse_components(&mut self, protected: bool) -> Vec<Component> {
        let stmt_start = self.start_of(0);
        let stmt_pos = self.pos;
        let mut parameter = false;
        while let Some(word) = self.ident_at(0) {
            if !COMPONENT_PREFIXES.contains(&word) {
                break;
            }
            parameter |= word == "parameter" || word == "constant";
            self.pos += 1;
        }
        if self.sym_at(0, '.') {
            self.pos += 1;
        }
        let mut type_name = String::new();
        while let Some(part) = self.ident_at(0) {
            type_name.push_str(part);
            self.pos += 1;
            if self.sym_at(0, '.') && self.ident_at(1).is_some() {
                type_name.push('.');
                self.pos += 1;
            } else {
                break;
            }
        }
        let mut type_dims = Vec::new();
        if !type_name.is_empty() && self.sym_at(0, '[') {
            match self.bracket_text() {
                Some(text) => type_dims = Self::split_dims(&text),
                None => return Vec::new(),
            }
        }

        let mut pending: Vec<(String, Vec<String>, Option<String>)> = Vec::new();
        let mut ok = !type_name.is_empty();
        while ok {
            let Some(name) = self.ident_at(0).map(str::to_string) else {
                ok = false;
                break;
            };
            self.pos += 1;
            let mut dims = type_dims.clone();
            if self.sym_at(0, '[') {
                match self.bracket_text() {
                    Some(text) => dims.extend(Self::split_dims(&text)),
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            let (binding, more) = self.scan_declaration_tail();
            pending.push((name, dims, binding));
            if !more {
                break;
            }
        }
        if !ok {
            self.pos = stmt_pos;
            self.skip_statement();
            return Vec::new();
        }
        let stmt_end = self.toks.get(self.pos - 1).map(|t| t.end).unwrap_or(self.src.len());
        pending
            .into_iter()
            .map(|(name, dims, binding)| Component {
                type_name: type_name.clone(),
                name,
                dims,
                binding,
                parameter,
                protected,
                span: stmt_start..stmt_end,
            })
            .collect()
    }

    /// Walks from after a component name to the next depth-zero `,` or `;`.
    /// Returns the binding text, if any, and whether another component
    /// follows in the same statement.
    fn scan_declaration_tail(&mut self) -> (Option<String>, bool) {
        let mut depth = 0i32;
        let mut binding_start: Option<usize> = None;
        let mut binding_end: Option<usize> = None;
        while let Some(t) = self.toks.get(self.pos).cloned() {
            self.pos += 1;
            let at_top = depth == 0;
            match &t.tok {
                Tok::Sym('(') | Tok::Sym('[') | Tok::Sym('{') => depth += 1,
                Tok::Sym(')') | Tok::Sym(']') | Tok::Sym('}') => depth -= 1,
                Tok::Sym('=') if at_top && binding_start.is_none() => {
                    binding_start = Some(t.end);
                    continue;
                }
                Tok::Sym(',') | Tok::Sym(';') if at_top => {
                    if binding_end.is_none() {
                        binding_end = Some(t.start);
                    }
                    let binding = binding_start
                        .zip(binding_end)
                        .map(|(s, e)| self.src[s..e].trim().to_string());
                    return (binding, matches!(t.tok, Tok::Sym(',')));
                }
                Tok::Str if at_top && binding_start.is_some() && binding_end.is_none() => {
                    binding_end = Some(t.start);
                }
                Tok::Ident(w) if at_top && w == "annotation" && binding_end.is_none() => {
                    binding_end = Some(t.start);
                }
                _ => {}
            }
        }
        (None, false)
    }
}

fn word_owned(t: &Token) -> String {
    match &t.tok {
        Tok::Ident(s) => s.clone(),
        _ => String::new(),
    }
}

/// Replacement of one byte range of a source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Splice {
    pub range: Range<usize>,
    pub text: String,
}

impl Splice {
    pub fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::replace(at..at, text)
    }
}

/// Applies non-overlapping splices to `source[window]` and returns the new
/// text of that window. Splice ranges are absolute offsets into `source`.
pub fn apply_splices(source: &str, window: Range<usize>, mut splices: Vec<Splice>) -> Result<String, String> {
    splices.sort_by_key(|s| (s.range.start, s.range.end));
    let mut out = String::with_capacity(window.len() + 256);
    let mut cursor = window.start;
    for splice in splices {
        if splice.range.start < cursor || splice.range.end > window.end {
            return Err(format!(
                "overlapping or out-of-range edit at {}..{}",
                splice.range.start, splice.range.end
            ));
        }
        out.push_str(&source[cursor..splice.range.start]);
        out.push_str(&splice.text);
        cursor = splice.range.end;
    }
    out.push_str(&source[cursor..window.end]);
    Ok(out)
}

/// Offset of the first byte of the line containing `offset`.
pub fn line_start(source: &str, offset: usize) -> usize {
    source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGE: &str = r#"within;
package Cycle "Fuel cycle"
  model DIV "Divertor"
    parameter Integer n = 5;
    Modelica.Blocks.Interfaces.RealInput from_plasma[n] "inflow";
    Modelica.Blocks.Interfaces.RealOutput to_CL[n] "to cooling loop";
    Modelica.Blocks.Interfaces.RealOutput to_TES "/* not a comment */";
    Real I[n](each start = 0);
  equation
    for i in 1:n loop
      der(I[i]) = from_plasma[i] - to_CL[i];
    end for;
    to_TES = sum(I);
    annotation(Icon(graphics = {Rectangle(extent = {{-100, 100}, {100, -100}})}));
  end DIV;

  model Plant
    // connect(commented, out);
    DIV div;
    Cycle.CL cl;
  equation
    connect(div.to_CL, cl.from_DIV) annotation(Line(points = {{0, 0}, {1, 1}}));
    connect(cl.to_DIV[2], div.from_plasma[2]);
  end Plant;
end Cycle;
"#;

    #[test]
    fn parses_nested_classes_and_sections() {
        let file = ModelFile::parse(PACKAGE).expect("parse");
        assert_eq!(file.within.as_deref(), Some(""));
        let pkg = file.class_path("Cycle").expect("pkg");
        assert_eq!(pkg.kind, "package");
        assert_eq!(pkg.classes.len(), 2);
        let div = file.class_path("Cycle.DIV").expect("div");
        assert_eq!(file.text(&div.name_span), "DIV");
        assert_eq!(file.text(&div.end_name_span), "DIV");
        assert!(file.text(&div.span).starts_with("model DIV"));
        assert!(file.text(&div.span).ends_with("end DIV;"));
        assert_eq!(div.annotations.len(), 1);
        assert!(div.equation_start.is_some());
    }

    #[test]
    fn ports_resolve_parameter_dimensions() {
        let file = ModelFile::parse(PACKAGE).expect("parse");
        let div = file.find("DIV").expect("div");
        let outputs = div.output_ports().expect("ports");
        assert_eq!(outputs.len(), 2);
        assert_eq!((outputs[0].name.as_str(), outputs[0].dim, outputs[0].array), ("to_CL", 5, true));
        assert_eq!((outputs[1].name.as_str(), outputs[1].dim, outputs[1].array), ("to_TES", 1, false));
        let inputs = div.input_ports().expect("ports");
        assert_eq!(inputs[0].name, "from_plasma");
        assert_eq!(div.dimension_parameters().len(), 1);
        assert_eq!(div.component("I").map(|c| c.dims.clone()), Some(vec!["n".to_string()]));
        assert_eq!(file.text(&outputs[0].span), "Modelica.Blocks.Interfaces.RealOutput to_CL[n] \"to cooling loop\";");
    }

    #[test]
    fn connections_skip_comments_and_keep_indices() {
        let file = ModelFile::parse(PACKAGE).expect("parse");
        let plant = file.find("Plant").expect("plant");
        assert_eq!(plant.connections.len(), 2);
        let first = &plant.connections[0];
        assert!(first.from.refers_to("div", "to_CL"));
        assert_eq!(first.to.to_string(), "cl.from_DIV");
        assert!(file.text(&first.span).ends_with("{1, 1}}));"));
        let second = &plant.connections[1];
        assert_eq!(second.to.index.as_deref(), Some("2"));
        assert_eq!(second.to.retarget("x", "y"), "x.y[2]");
        assert_eq!(plant.component("cl").map(|c| c.type_name.as_str()), Some("Cycle.CL"));
        assert_eq!(plant.connections_touching("div", "from_plasma").len(), 1);
    }

    #[test]
    fn comma_lists_and_bindings() {
        let src = "model M\n  parameter Real a = 1.5 \"x\", b = 2;\n  Real c;\nend M;\n";
        let file = ModelFile::parse(src).expect("parse");
        let m = file.find("M").expect("m");
        let names: Vec<&str> = m.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(m.components[0].binding.as_deref(), Some("1.5"));
        assert_eq!(m.components[1].binding.as_deref(), Some("2"));
        assert!(m.components[0].parameter);
        assert!(!m.components[2].parameter);
    }

    #[test]
    fn unterminated_class_is_an_error() {
        let err = ModelFile::parse("model M\n  Real x;\n").expect_err("must fail");
        assert!(err.message.contains("not terminated"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn splices_apply_in_order() {
        let src = "abcdef";
        let out = apply_splices(
            src,
            1..5,
            vec![Splice::replace(3..4, "D"), Splice::insert(1, "[")],
        )
        .expect("splice");
        assert_eq!(out, "[bcDe");
        assert!(apply_splices(src, 0..6, vec![Splice::replace(1..3, ""), Splice::replace(2..4, "")]).is_err());
        assert_eq!(line_start("ab\ncd", 4), 3);
    }
}

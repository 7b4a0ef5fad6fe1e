//! Minimal WGSL reflection.
//!
//! Draw programs address shader inputs by name, so we need the vertex
//! attribute locations, uniform declarations and texture/sampler bindings
//! of a module before wgpu ever sees it. A full parser is not required:
//! declarations are recoverable from the token stream alone, skipping
//! function bodies wholesale.

use std::collections::HashMap;

/// Uniform types a draw program can feed. Anything else in a
/// `var<uniform>` declaration is a compile error for our purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniformType {
    F32,
    I32,
    U32,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
}

impl UniformType {
    /// Byte size of the value as written into a uniform buffer. mat3x3
    /// columns are vec4-aligned.
    pub fn byte_size(self) -> usize {
        match self {
            UniformType::F32 | UniformType::I32 | UniformType::U32 => 4,
            UniformType::Vec2 => 8,
            UniformType::Vec3 => 12,
            UniformType::Vec4 => 16,
            UniformType::Mat3 => 48,
            UniformType::Mat4 => 64,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AttributeDecl {
    pub name: String,
    pub location: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct UniformDecl {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub ty: UniformType,
}

#[derive(Debug, Clone)]
pub(crate) struct TextureDecl {
    pub name: String,
    pub group: u32,
    pub binding: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct SamplerDecl {
    pub name: String,
    pub group: u32,
    pub binding: u32,
}

/// Everything a draw program needs to know about a compiled module.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reflection {
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub attributes: Vec<AttributeDecl>,
    pub uniforms: Vec<UniformDecl>,
    pub textures: Vec<TextureDecl>,
    pub samplers: Vec<SamplerDecl>,
}

impl Reflection {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDecl> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformDecl> {
        self.uniforms.iter().find(|u| u.name == name)
    }

    pub fn texture(&self, name: &str) -> Option<&TextureDecl> {
        self.textures.iter().find(|t| t.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.attribute(name).is_some()
            || self.uniform(name).is_some()
            || self.texture(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(u32),
    Sym(char),
}

fn lex(source: &str) -> Vec<Tok> {
    let bytes = source.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            let mut depth = 1;
            i += 2;
            while i + 1 < bytes.len() && depth > 0 {
                if bytes[i] == b'/' && bytes[i + 1] == b'*' {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            toks.push(Tok::Ident(source[start..i].to_string()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                i += 1;
            }
            toks.push(Tok::Number(source[start..i].parse().unwrap_or(0)));
        } else {
            toks.push(Tok::Sym(c));
            i += 1;
        }
    }
    toks
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

#[derive(Debug, Clone, Default)]
struct Attrs {
    location: Option<u32>,
    group: Option<u32>,
    binding: Option<u32>,
    builtin: bool,
    vertex: bool,
    fragment: bool,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Tok::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.bump() {
            Some(Tok::Ident(name)) => Ok(name),
            other => Err(format!("expected identifier, got {other:?}")),
        }
    }

    /// Consumes a run of `@attr` / `@attr(arg)` markers.
    fn parse_attrs(&mut self) -> Attrs {
        let mut attrs = Attrs::default();
        while self.eat_sym('@') {
            let name = match self.bump() {
                Some(Tok::Ident(name)) => name,
                _ => break,
            };
            let mut arg = None;
            if self.eat_sym('(') {
                let mut depth = 1;
                while depth > 0 {
                    match self.bump() {
                        Some(Tok::Sym('(')) => depth += 1,
                        Some(Tok::Sym(')')) => depth -= 1,
                        Some(Tok::Number(n)) if arg.is_none() && depth == 1 => arg = Some(n),
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            match name.as_str() {
                "location" => attrs.location = arg,
                "group" => attrs.group = arg,
                "binding" => attrs.binding = arg,
                "builtin" => attrs.builtin = true,
                "vertex" => attrs.vertex = true,
                "fragment" => attrs.fragment = true,
                _ => {}
            }
        }
        attrs
    }

    /// Reads a type expression into a canonical string, e.g.
    /// `vec3<f32>` or `texture_2d<f32>`.
    fn parse_type(&mut self) -> Result<String, String> {
        let mut out = self.expect_ident()?;
        if self.eat_sym('<') {
            out.push('<');
            let mut depth = 1;
            while depth > 0 {
                match self.bump() {
                    Some(Tok::Sym('<')) => {
                        depth += 1;
                        out.push('<');
                    }
                    Some(Tok::Sym('>')) => {
                        depth -= 1;
                        if depth > 0 {
                            out.push('>');
                        }
                    }
                    Some(Tok::Ident(name)) => out.push_str(&name),
                    Some(Tok::Number(n)) => out.push_str(&n.to_string()),
                    Some(Tok::Sym(c)) => out.push(c),
                    None => return Err("unterminated type template".into()),
                }
            }
            out.push('>');
        }
        Ok(out)
    }

    fn skip_balanced(&mut self, open: char, close: char) {
        if !self.eat_sym(open) {
            return;
        }
        let mut depth = 1;
        while depth > 0 {
            match self.bump() {
                Some(Tok::Sym(c)) if c == open => depth += 1,
                Some(Tok::Sym(c)) if c == close => depth -= 1,
                Some(_) => {}
                None => break,
            }
        }
    }

    fn skip_to_sym(&mut self, sym: char) {
        while let Some(tok) = self.bump() {
            if tok == Tok::Sym(sym) {
                break;
            }
        }
    }
}

fn uniform_type(ty: &str) -> Option<UniformType> {
    match ty {
        "f32" => Some(UniformType::F32),
        "i32" => Some(UniformType::I32),
        "u32" => Some(UniformType::U32),
        "vec2<f32>" | "vec2f" => Some(UniformType::Vec2),
        "vec3<f32>" | "vec3f" => Some(UniformType::Vec3),
        "vec4<f32>" | "vec4f" => Some(UniformType::Vec4),
        "mat3x3<f32>" | "mat3x3f" => Some(UniformType::Mat3),
        "mat4x4<f32>" | "mat4x4f" => Some(UniformType::Mat4),
        _ => None,
    }
}

/// Extracts the reflection data from WGSL source. Returns a plain error
/// message; the caller attaches the file path.
pub(crate) fn reflect(source: &str) -> Result<Reflection, String> {
    let mut parser = Parser {
        toks: lex(source),
        pos: 0,
    };

    // struct name -> located fields
    let mut structs: HashMap<String, Vec<AttributeDecl>> = HashMap::new();
    let mut out = Reflection::default();
    // (entry params, is_vertex) deferred until all structs are known
    let mut vertex_params: Vec<(String, Option<u32>, String)> = Vec::new();

    while parser.peek().is_some() {
        let attrs = parser.parse_attrs();
        match parser.bump() {
            Some(Tok::Ident(kw)) if kw == "struct" => {
                let name = parser.expect_ident()?;
                let mut fields = Vec::new();
                if parser.eat_sym('{') {
                    loop {
                        if parser.eat_sym('}') || parser.peek().is_none() {
                            break;
                        }
                        let field_attrs = parser.parse_attrs();
                        let field_name = parser.expect_ident()?;
                        if !parser.eat_sym(':') {
                            parser.skip_to_sym('}');
                            break;
                        }
                        let _ty = parser.parse_type()?;
                        if let (Some(location), false) = (field_attrs.location, field_attrs.builtin)
                        {
                            fields.push(AttributeDecl {
                                name: field_name,
                                location,
                            });
                        }
                        parser.eat_sym(',');
                    }
                }
                structs.insert(name, fields);
            }
            Some(Tok::Ident(kw)) if kw == "fn" => {
                let name = parser.expect_ident()?;
                let mut params: Vec<(String, Option<u32>, String)> = Vec::new();
                if parser.eat_sym('(') {
                    loop {
                        if parser.eat_sym(')') || parser.peek().is_none() {
                            break;
                        }
                        let param_attrs = parser.parse_attrs();
                        let param_name = parser.expect_ident()?;
                        if !parser.eat_sym(':') {
                            break;
                        }
                        let ty = parser.parse_type()?;
                        if !param_attrs.builtin {
                            params.push((param_name, param_attrs.location, ty));
                        }
                        parser.eat_sym(',');
                    }
                }
                // return type and body
                while let Some(tok) = parser.peek() {
                    if *tok == Tok::Sym('{') {
                        break;
                    }
                    parser.bump();
                }
                parser.skip_balanced('{', '}');

                if attrs.vertex {
                    out.vertex_entry = name;
                    vertex_params = params;
                } else if attrs.fragment {
                    out.fragment_entry = name;
                }
            }
            Some(Tok::Ident(kw)) if kw == "var" => {
                let mut space = String::new();
                if parser.eat_sym('<') {
                    while let Some(tok) = parser.bump() {
                        match tok {
                            Tok::Sym('>') => break,
                            Tok::Ident(name) if space.is_empty() => space = name,
                            _ => {}
                        }
                    }
                }
                let name = parser.expect_ident()?;
                if !parser.eat_sym(':') {
                    parser.skip_to_sym(';');
                    continue;
                }
                let ty = parser.parse_type()?;
                parser.skip_to_sym(';');

                let group = attrs.group.unwrap_or(0);
                let binding = attrs.binding.unwrap_or(0);
                if space == "uniform" {
                    let ty = uniform_type(&ty)
                        .ok_or_else(|| format!("unsupported uniform type `{ty}` for `{name}`"))?;
                    out.uniforms.push(UniformDecl {
                        name,
                        group,
                        binding,
                        ty,
                    });
                } else if ty.starts_with("texture_") {
                    out.textures.push(TextureDecl {
                        name,
                        group,
                        binding,
                    });
                } else if ty.starts_with("sampler") {
                    out.samplers.push(SamplerDecl {
                        name,
                        group,
                        binding,
                    });
                }
            }
            // const, alias, let, override, enable and stray tokens
            Some(Tok::Ident(_)) => parser.skip_to_sym(';'),
            Some(_) => {}
            None => break,
        }
    }

    for (name, location, ty) in vertex_params {
        if let Some(fields) = structs.get(&ty) {
            out.attributes.extend(fields.iter().cloned());
        } else if let Some(location) = location {
            out.attributes.push(AttributeDecl { name, location });
        }
    }
    out.attributes.sort_by_key(|a| a.location);

    if out.vertex_entry.is_empty() {
        return Err("no @vertex entry point found".into());
    }
    if out.fragment_entry.is_empty() {
        return Err("no @fragment entry point found".into());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        struct VertexInput {
            @location(0) in_position: vec3<f32>,
            @location(1) in_color: vec4<f32>,
        };

        struct VertexOutput {
            @builtin(position) clip_position: vec4<f32>,
            @location(0) color: vec4<f32>,
        };

        @group(0) @binding(0) var<uniform> ProjModelview: mat4x4<f32>;
        @group(0) @binding(1) var<uniform> PointScale: f32;
        @group(0) @binding(2) var base_map: texture_2d<f32>;
        @group(0) @binding(3) var base_sampler: sampler;

        // entry points
        @vertex
        fn vs_main(input: VertexInput) -> VertexOutput {
            var out: VertexOutput;
            out.clip_position = ProjModelview * vec4<f32>(input.in_position, 1.0);
            out.color = input.in_color * PointScale;
            return out;
        }

        @fragment
        fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
            return in.color;
        }
    "#;

    #[test]
    fn test_reflects_entries_and_attributes() {
        let refl = reflect(SOURCE).unwrap();
        assert_eq!(refl.vertex_entry, "vs_main");
        assert_eq!(refl.fragment_entry, "fs_main");
        assert_eq!(refl.attributes.len(), 2);
        assert_eq!(refl.attribute("in_position").unwrap().location, 0);
        assert_eq!(refl.attribute("in_color").unwrap().location, 1);
    }

    #[test]
    fn test_reflects_uniforms_and_textures() {
        let refl = reflect(SOURCE).unwrap();
        assert_eq!(refl.uniform("ProjModelview").unwrap().ty, UniformType::Mat4);
        assert_eq!(refl.uniform("PointScale").unwrap().ty, UniformType::F32);
        assert_eq!(refl.uniform("PointScale").unwrap().binding, 1);
        assert_eq!(refl.texture("base_map").unwrap().binding, 2);
        assert_eq!(refl.samplers.len(), 1);
        assert!(refl.has_input("in_position"));
        assert!(!refl.has_input("missing"));
    }

    #[test]
    fn test_direct_location_params() {
        let src = r#"
            @group(0) @binding(0) var<uniform> Transform: mat4x4<f32>;
            @vertex
            fn vs_main(@location(0) pos: vec3<f32>, @builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
                return Transform * vec4<f32>(pos, 1.0);
            }
            @fragment
            fn fs_main() -> @location(0) vec4<f32> {
                return vec4<f32>(1.0);
            }
        "#;
        let refl = reflect(src).unwrap();
        assert_eq!(refl.attributes.len(), 1);
        assert_eq!(refl.attribute("pos").unwrap().location, 0);
    }

    #[test]
    fn test_rejects_unsupported_uniform() {
        let src = r#"
            struct Big { a: array<vec4<f32>, 16> };
            @group(0) @binding(0) var<uniform> stuff: Big;
            @vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }
            @fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }
        "#;
        assert!(reflect(src).is_err());
    }

    #[test]
    fn test_comments_are_skipped() {
        let src = r#"
            // @group(9) @binding(9) var<uniform> Ghost: f32;
            /* struct Phantom { @location(7) x: f32 } */
            @vertex fn vs_main(@location(0) p: vec2<f32>) -> @builtin(position) vec4<f32> {
                return vec4<f32>(p, 0.0, 1.0);
            }
            @fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }
        "#;
        let refl = reflect(src).unwrap();
        assert!(refl.uniforms.is_empty());
        assert_eq!(refl.attributes.len(), 1);
    }
}

//! Derived bands (spectral indexes) computed from arithmetic expressions
//! over cube band names, e.g. `10000. * (NIR - RED) / (NIR + RED)`.

use crate::io::cube_path::{CubeKey, CubePaths};
use crate::io::raster_store::RasterStore;
use crate::types::{CubeError, CubeResult, DataType, Pixel, RasterImage};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Eof,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, msg: impl Into<String>) -> CubeError {
        CubeError::InvalidFormat(format!("{} at column {}", msg.into(), self.pos + 1))
    }

    fn next_token(&mut self) -> CubeResult<Token> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }

        let Some(&b) = self.input.get(self.pos) else {
            return Ok(Token::Eof);
        };

        let single = match b {
            b'+' => Some(Token::Plus),
            b'-' => Some(Token::Minus),
            b'*' => Some(Token::Star),
            b'/' => Some(Token::Slash),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(token) = single {
            self.pos += 1;
            return Ok(token);
        }

        match b {
            b'0'..=b'9' | b'.' => self.read_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => Ok(self.read_ident()),
            _ => Err(self.error(format!("Unexpected character {:?}", b as char))),
        }
    }

    fn read_number(&mut self) -> CubeResult<Token> {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == b'.')
        {
            self.pos += 1;
        }
        // exponent: 1e-4, 2.5E3
        if self.pos < self.input.len() && matches!(self.input[self.pos], b'e' | b'E') {
            let mut end = self.pos + 1;
            if end < self.input.len() && matches!(self.input[end], b'+' | b'-') {
                end += 1;
            }
            if end < self.input.len() && self.input[end].is_ascii_digit() {
                self.pos = end;
                while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }

        let text = String::from_utf8_lossy(&self.input[start..self.pos]);
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("Invalid number '{}'", text)))
    }

    fn read_ident(&mut self) -> Token {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_alphanumeric() || self.input[self.pos] == b'_')
        {
            self.pos += 1;
        }
        Token::Ident(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    /// Index into the expression's band list
    Band(usize),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// `None` when an input is missing or a division by zero occurs
    fn eval(&self, values: &[Option<Pixel>]) -> Option<Pixel> {
        match self {
            Expr::Number(v) => Some(*v),
            Expr::Band(index) => values.get(*index).copied().flatten(),
            Expr::Neg(inner) => inner.eval(values).map(|v| -v),
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(values)?;
                let b = rhs.eval(values)?;
                match op {
                    Op::Add => Some(a + b),
                    Op::Sub => Some(a - b),
                    Op::Mul => Some(a * b),
                    Op::Div if b == 0.0 => None,
                    Op::Div => Some(a / b),
                }
            }
        }
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    bands: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> CubeResult<Self> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            bands: Vec::new(),
        })
    }

    fn bump(&mut self) -> CubeResult<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> CubeResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.current {
                Token::Plus => Op::Add,
                Token::Minus => Op::Sub,
                _ => return Ok(lhs),
            };
            self.bump()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> CubeResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.current {
                Token::Star => Op::Mul,
                Token::Slash => Op::Div,
                _ => return Ok(lhs),
            };
            self.bump()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> CubeResult<Expr> {
        match self.current {
            Token::Minus => {
                self.bump()?;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Token::Plus => {
                self.bump()?;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> CubeResult<Expr> {
        match self.bump()? {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::Ident(name) => {
                let index = match self.bands.iter().position(|b| *b == name) {
                    Some(index) => index,
                    None => {
                        self.bands.push(name);
                        self.bands.len() - 1
                    }
                };
                Ok(Expr::Band(index))
            }
            Token::LParen => {
                let inner = self.expr()?;
                match self.bump()? {
                    Token::RParen => Ok(inner),
                    other => Err(self.lexer.error(format!("Expected ')', found {:?}", other))),
                }
            }
            other => Err(self.lexer.error(format!("Unexpected token {:?}", other))),
        }
    }
}

/// Parsed band arithmetic expression
#[derive(Debug, Clone, PartialEq)]
pub struct BandExpression {
    expr: Expr,
    bands: Vec<String>,
}

impl BandExpression {
    pub fn parse(input: &str) -> CubeResult<Self> {
        let mut parser = Parser::new(input)?;
        let expr = parser.expr()?;
        if parser.current != Token::Eof {
            return Err(parser
                .lexer
                .error(format!("Unexpected trailing {:?} in '{}'", parser.current, input)));
        }
        Ok(Self {
            expr,
            bands: parser.bands,
        })
    }

    /// Band names referenced by the expression, in order of appearance
    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    /// Evaluate with one value per referenced band (`None` for nodata)
    pub fn evaluate(&self, values: &[Option<Pixel>]) -> Option<Pixel> {
        self.expr.eval(values)
    }
}

/// Definition of a derived band
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandIndex {
    pub name: String,
    pub expression: String,
    pub dtype: DataType,
    pub nodata: Pixel,
}

/// Generate every index whose inputs are available.
///
/// `band_files` maps cube band names to rasters sharing one geometry.
/// Indexes referencing a missing band are skipped with a warning. Returns the
/// generated file of each index.
pub fn generate_band_indexes(
    store: &dyn RasterStore,
    indexes: &[BandIndex],
    band_files: &BTreeMap<String, PathBuf>,
    paths: &CubePaths,
    key: &CubeKey,
    composed: bool,
) -> CubeResult<BTreeMap<String, PathBuf>> {
    let mut output = BTreeMap::new();
    if indexes.is_empty() {
        return Ok(output);
    }

    let reference = band_files.values().next().ok_or_else(|| {
        CubeError::Configuration("Can't generate band indexes without band files".to_string())
    })?;
    let profile = store.info(reference)?;

    for index in indexes {
        let expression = BandExpression::parse(&index.expression)?;

        if let Some(missing) = expression.bands().iter().find(|b| !band_files.contains_key(*b)) {
            log::warn!(
                "Band {} is not available in cube {}. Skipping index {}",
                missing,
                key.cube,
                index.name
            );
            continue;
        }

        let inputs = expression
            .bands()
            .iter()
            .map(|band| {
                let file = &band_files[band];
                let info = store.info(file)?;
                if info.shape() != profile.shape() {
                    return Err(CubeError::Configuration(format!(
                        "Band {} does not match the geometry of {}",
                        band,
                        reference.display()
                    )));
                }
                Ok((file.as_path(), info.nodata))
            })
            .collect::<CubeResult<Vec<_>>>()?;

        let file = paths.file(key, Some(&index.name), Some(".tif"), composed)?;
        log::info!("Generating band {} for cube {} - {}", index.name, key.cube, file.display());

        let mut raster: RasterImage = Array2::from_elem(profile.shape(), index.nodata);
        let mut values = vec![None; inputs.len()];

        for window in profile.windows() {
            let blocks = inputs
                .iter()
                .map(|(path, _)| store.read_window(path, window))
                .collect::<CubeResult<Vec<_>>>()?;

            let mut target = raster.slice_mut(s![window.rows(), window.cols()]);
            for ((row, col), out) in target.indexed_iter_mut() {
                for (slot, (block, (_, nodata))) in values.iter_mut().zip(blocks.iter().zip(&inputs)) {
                    let v = block[[row, col]];
                    *slot = (Some(v) != *nodata && !v.is_nan()).then_some(v);
                }
                if let Some(v) = expression.evaluate(&values).filter(|v| v.is_finite()) {
                    *out = index.dtype.coerce(v);
                }
            }
        }

        let index_profile = profile
            .clone()
            .with_dtype(index.dtype)
            .with_nodata(Some(index.nodata))
            .with_tags(BTreeMap::new());
        store.write(&file, &raster, &index_profile)?;

        output.insert(index.name.clone(), file);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_parse_precedence() {
        let expr = BandExpression::parse("1 + 2 * 3 - -4 / 2").unwrap();
        assert_eq!(expr.evaluate(&[]), Some(9.0));

        let expr = BandExpression::parse("(1 + 2) * 3").unwrap();
        assert_eq!(expr.evaluate(&[]), Some(9.0));
    }

    #[test]
    fn test_ndvi_expression() {
        let expr = BandExpression::parse("10000. * (NIR - RED) / (NIR + RED)").unwrap();
        assert_eq!(expr.bands(), &["NIR".to_string(), "RED".to_string()]);

        let ndvi = expr.evaluate(&[Some(3000.0), Some(1000.0)]).unwrap();
        assert_abs_diff_eq!(ndvi, 5000.0);

        assert_eq!(expr.evaluate(&[None, Some(1000.0)]), None);
        assert_eq!(expr.evaluate(&[Some(0.0), Some(0.0)]), None);
    }

    #[test]
    fn test_evi_expression_with_exponent() {
        let expr = BandExpression::parse(
            "10000. * 2.5 * (NIR - RED) / (NIR + 6. * RED - 7.5 * BLUE + 1e4)",
        )
        .unwrap();
        assert_eq!(expr.bands().len(), 3);
        assert!(expr.evaluate(&[Some(3000.0), Some(1000.0), Some(500.0)]).is_some());
    }

    #[test]
    fn test_malformed_expressions() {
        for input in ["NIR +", "(NIR - RED", "NIR $ RED", "NIR RED", ""] {
            assert!(
                matches!(BandExpression::parse(input), Err(CubeError::InvalidFormat(_))),
                "{} should not parse",
                input
            );
        }
    }
}

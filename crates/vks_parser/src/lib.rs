use vks_syntax::{
    Ast, BinOp, BuiltinFn, Literal, LogicOp, Node, NodeId, Pos, SyntaxError, UnOp, VarInit,
};

const RESERVED: &[&str] = &["if", "while", "var", "delete", "return", "API"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    BangEq,
    Gt,
    Lt,
    Ge,
    Le,
    OrOr,
    AndAnd,
    Bang,
    Comma,
    Semi,
    Dot,
    AtDot,
    Assign,
    Amp,
    Pipe,
    Shr,
    Shl,
    Tilde,
    Colon,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Plus => write!(f, "`+`"),
            OpKind::Minus => write!(f, "`-`"),
            OpKind::Star => write!(f, "`*`"),
            OpKind::Slash => write!(f, "`/`"),
            OpKind::Percent => write!(f, "`%`"),
            OpKind::EqEq => write!(f, "`==`"),
            OpKind::BangEq => write!(f, "`!=`"),
            OpKind::Gt => write!(f, "`>`"),
            OpKind::Lt => write!(f, "`<`"),
            OpKind::Ge => write!(f, "`>=`"),
            OpKind::Le => write!(f, "`<=`"),
            OpKind::OrOr => write!(f, "`||`"),
            OpKind::AndAnd => write!(f, "`&&`"),
            OpKind::Bang => write!(f, "`!`"),
            OpKind::Comma => write!(f, "`,`"),
            OpKind::Semi => write!(f, "`;`"),
            OpKind::Dot => write!(f, "`.`"),
            OpKind::AtDot => write!(f, "`@.`"),
            OpKind::Assign => write!(f, "`=`"),
            OpKind::Amp => write!(f, "`&`"),
            OpKind::Pipe => write!(f, "`|`"),
            OpKind::Shr => write!(f, "`>>`"),
            OpKind::Shl => write!(f, "`<<`"),
            OpKind::Tilde => write!(f, "`~`"),
            OpKind::Colon => write!(f, "`:`"),
        }
    }
}

/// Bracket pairing is resolved during lexing, so token streams are trees.
/// `Ternary` groups span from `?` to the matching `:`; a `:` with no open
/// `?` group lexes as an ordinary [`OpKind::Colon`] operator, which is how
/// object literals get their key separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GroupKind {
    Source,
    Parens,
    Bracket,
    Brace,
    Ternary,
}

impl GroupKind {
    fn opened_by(c: char) -> Option<GroupKind> {
        match c {
            '(' => Some(GroupKind::Parens),
            '[' => Some(GroupKind::Bracket),
            '{' => Some(GroupKind::Brace),
            '?' => Some(GroupKind::Ternary),
            _ => None,
        }
    }

    fn closer(self) -> Option<char> {
        match self {
            GroupKind::Source => None,
            GroupKind::Parens => Some(')'),
            GroupKind::Bracket => Some(']'),
            GroupKind::Brace => Some('}'),
            GroupKind::Ternary => Some(':'),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Group {
    pub kind: GroupKind,
    pub items: Vec<Token>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Token {
    Ident(String, Pos),
    Str(String, Pos),
    Op(OpKind, Pos),
    Group(Group),
}

impl Token {
    pub fn pos(&self) -> Pos {
        match self {
            Token::Ident(_, pos) | Token::Str(_, pos) | Token::Op(_, pos) => *pos,
            Token::Group(group) => group.pos,
        }
    }
}

fn is_op(token: &Token, kind: OpKind) -> bool {
    matches!(token, Token::Op(k, _) if *k == kind)
}

struct Lexer<'a> {
    chars: std::str::Chars<'a>,
    current: Option<char>,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        let mut chars = source.chars();
        let current = chars.next();
        Self {
            chars,
            current,
            line: 1,
            col: 1,
        }
    }

    fn pos(&self) -> Pos {
        Pos::new(self.line, self.col)
    }

    fn bump(&mut self) {
        if self.current == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.current = self.chars.next();
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.current {
            if !c.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    fn read_ident(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.current {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            self.bump();
        }
        name
    }

    /// Reads a quoted string, returning the decoded value. Escapes are
    /// decoded with the JSON rules; a `'`-delimited literal may contain
    /// bare `"` characters, which are re-escaped before decoding.
    fn read_string(&mut self) -> Result<String, SyntaxError> {
        let start = self.pos();
        let delim = match self.current {
            Some(c) => c,
            None => return Err(SyntaxError::at("unexpected EOL while parsing", start)),
        };
        self.bump();
        let mut body = String::new();
        let mut escaped = false;
        loop {
            let pos = self.pos();
            let c = match self.current {
                None | Some('\n') => {
                    return Err(SyntaxError::at("unexpected EOL while parsing", pos))
                }
                Some(c) => c,
            };
            self.bump();
            if escaped {
                body.push(c);
                escaped = false;
                continue;
            }
            if c == '\\' {
                body.push(c);
                escaped = true;
                continue;
            }
            if c == delim {
                break;
            }
            if delim == '\'' && c == '"' {
                body.push('\\');
            }
            body.push(c);
        }
        let quoted = format!("\"{body}\"");
        serde_json::from_str::<String>(&quoted)
            .map_err(|_| SyntaxError::at(format!("invalid string literal: {body}"), start))
    }

    /// Reads one operator, or skips a comment and returns `None`. The
    /// caller guarantees `current` is not whitespace, an identifier
    /// character, a quote or a bracket.
    fn read_operator(&mut self) -> Result<Option<OpKind>, SyntaxError> {
        let pos = self.pos();
        let kind = match self.current {
            Some('+') => {
                self.bump();
                OpKind::Plus
            }
            Some('-') => {
                self.bump();
                OpKind::Minus
            }
            Some('*') => {
                self.bump();
                OpKind::Star
            }
            Some('/') => {
                self.bump();
                match self.current {
                    Some('/') => {
                        self.bump();
                        while let Some(c) = self.current {
                            self.bump();
                            if c == '\n' {
                                break;
                            }
                        }
                        return Ok(None);
                    }
                    Some('*') => {
                        self.bump();
                        self.skip_block_comment()?;
                        return Ok(None);
                    }
                    _ => OpKind::Slash,
                }
            }
            Some('%') => {
                self.bump();
                OpKind::Percent
            }
            Some('=') => {
                self.bump();
                if self.current == Some('=') {
                    self.bump();
                    OpKind::EqEq
                } else {
                    OpKind::Assign
                }
            }
            Some('!') => {
                self.bump();
                if self.current == Some('=') {
                    self.bump();
                    OpKind::BangEq
                } else {
                    OpKind::Bang
                }
            }
            Some('>') => {
                self.bump();
                match self.current {
                    Some('=') => {
                        self.bump();
                        OpKind::Ge
                    }
                    Some('>') => {
                        self.bump();
                        OpKind::Shr
                    }
                    _ => OpKind::Gt,
                }
            }
            Some('<') => {
                self.bump();
                match self.current {
                    Some('=') => {
                        self.bump();
                        OpKind::Le
                    }
                    Some('<') => {
                        self.bump();
                        OpKind::Shl
                    }
                    _ => OpKind::Lt,
                }
            }
            Some('|') => {
                self.bump();
                if self.current == Some('|') {
                    self.bump();
                    OpKind::OrOr
                } else {
                    OpKind::Pipe
                }
            }
            Some('&') => {
                self.bump();
                if self.current == Some('&') {
                    self.bump();
                    OpKind::AndAnd
                } else {
                    OpKind::Amp
                }
            }
            Some(',') => {
                self.bump();
                OpKind::Comma
            }
            Some(';') => {
                self.bump();
                OpKind::Semi
            }
            Some('~') => {
                self.bump();
                OpKind::Tilde
            }
            Some(':') => {
                self.bump();
                OpKind::Colon
            }
            Some('.') => {
                self.bump();
                OpKind::Dot
            }
            Some('@') => {
                self.bump();
                if self.current == Some('.') {
                    self.bump();
                    OpKind::AtDot
                } else {
                    return Err(self.unknown_operator("@", pos));
                }
            }
            _ => return Err(self.unknown_operator("", pos)),
        };
        Ok(Some(kind))
    }

    fn skip_block_comment(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.current {
                None => {
                    return Err(SyntaxError::at("unexpected EOF while parsing", self.pos()))
                }
                Some('*') => {
                    self.bump();
                    if self.current == Some('/') {
                        self.bump();
                        return Ok(());
                    }
                }
                Some(_) => self.bump(),
            }
        }
    }

    /// The reported text is the consumed prefix plus the character that
    /// broke the match, unless that character could start an identifier.
    fn unknown_operator(&self, consumed: &str, pos: Pos) -> SyntaxError {
        let mut shown = consumed.to_string();
        if let Some(c) = self.current {
            if !(c.is_alphanumeric() || c == '_' || c.is_whitespace()) {
                shown.push(c);
            }
        }
        SyntaxError::at(format!("unknown operator: {shown}"), pos)
    }
}

/// Lexes a source string into a token tree rooted at a
/// [`GroupKind::Source`] group.
pub fn lex(source: &str) -> Result<Group, SyntaxError> {
    let mut lx = Lexer::new(source);
    let mut root = Group {
        kind: GroupKind::Source,
        items: Vec::new(),
        pos: Pos::new(1, 1),
    };
    let mut open: Vec<Group> = Vec::new();
    loop {
        lx.skip_whitespace();
        let Some(c) = lx.current else { break };
        let pos = lx.pos();
        let top_closer = open.last().and_then(|g| g.kind.closer());
        if c.is_alphanumeric() || c == '_' {
            let name = lx.read_ident();
            top(&mut root, &mut open).items.push(Token::Ident(name, pos));
        } else if c == '"' || c == '\'' {
            let value = lx.read_string()?;
            top(&mut root, &mut open).items.push(Token::Str(value, pos));
        } else if let Some(kind) = GroupKind::opened_by(c) {
            lx.bump();
            open.push(Group {
                kind,
                items: Vec::new(),
                pos,
            });
        } else if top_closer == Some(c) {
            lx.bump();
            if let Some(done) = open.pop() {
                top(&mut root, &mut open).items.push(Token::Group(done));
            }
        } else if matches!(c, ')' | ']' | '}') {
            return Err(SyntaxError::at("non-matching bracket", pos));
        } else if let Some(kind) = lx.read_operator()? {
            top(&mut root, &mut open).items.push(Token::Op(kind, pos));
        }
    }
    if !open.is_empty() {
        return Err(SyntaxError::at("unexpected EOF while parsing", lx.pos()));
    }
    Ok(root)
}

fn top<'g>(root: &'g mut Group, open: &'g mut Vec<Group>) -> &'g mut Group {
    match open.last_mut() {
        Some(group) => group,
        None => root,
    }
}

/// Expression precedence tiers, loosest binding first. A tier with no
/// matching operator falls through to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Assign,
    Ternary,
    Or,
    And,
    BitOr,
    BitAnd,
    Eq,
    Compare,
    Shift,
    AddSub,
    Mul,
    Unary,
    Atomic,
}

enum Build {
    Stmts { tokens: Vec<Token>, scoped: bool },
    Expr { tier: Tier, tokens: Vec<Token> },
}

enum Outcome {
    Node(Node),
    Again(Build),
}

enum Slot {
    Done(Node),
    Todo(Build),
}

/// Where the next statement lands: the enclosing block, or the body of
/// the most recent `if`, `else` or `while` header.
#[derive(Clone, Copy)]
enum StmtSink {
    Top,
    IfBody(NodeId),
    IfElse(NodeId),
    WhileBody(NodeId),
}

struct Parser {
    slots: Vec<Slot>,
}

/// Parses a source string: lexes it and builds the AST.
pub fn parse(source: &str) -> Result<Ast, SyntaxError> {
    parse_tokens(lex(source)?)
}

/// Builds the AST from an already-lexed token tree. Node construction is
/// driven by an explicit work stack over the arena, so nesting depth is
/// not limited by the call stack.
pub fn parse_tokens(root: Group) -> Result<Ast, SyntaxError> {
    let mut parser = Parser { slots: Vec::new() };
    let root_id = parser.alloc(Slot::Todo(Build::Stmts {
        tokens: root.items,
        scoped: false,
    }));
    let mut work = vec![root_id];
    while let Some(id) = work.pop() {
        loop {
            let build = match &mut parser.slots[id.index()] {
                Slot::Done(_) => break,
                slot => {
                    match std::mem::replace(slot, Slot::Done(Node::Literal(Literal::Null))) {
                        Slot::Todo(build) => build,
                        Slot::Done(_) => unreachable!(),
                    }
                }
            };
            match parser.run(build)? {
                Outcome::Node(node) => parser.slots[id.index()] = Slot::Done(node),
                Outcome::Again(build) => parser.slots[id.index()] = Slot::Todo(build),
            }
        }
        if let Slot::Done(node) = &parser.slots[id.index()] {
            work.extend(node.children());
        }
    }
    let nodes = parser
        .slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Done(node) => node,
            Slot::Todo(_) => unreachable!(),
        })
        .collect();
    Ok(Ast {
        nodes,
        root: root_id,
    })
}

impl Parser {
    fn alloc(&mut self, slot: Slot) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(slot);
        id
    }

    fn done(&mut self, node: Node) -> NodeId {
        self.alloc(Slot::Done(node))
    }

    fn expr(&mut self, tier: Tier, tokens: Vec<Token>) -> NodeId {
        self.alloc(Slot::Todo(Build::Expr { tier, tokens }))
    }

    fn run(&mut self, build: Build) -> Result<Outcome, SyntaxError> {
        match build {
            Build::Stmts { tokens, scoped } => {
                Ok(Outcome::Node(self.build_stmts(tokens, scoped)?))
            }
            Build::Expr { tier, tokens } => self.build_expr(tier, tokens),
        }
    }

    fn push_into(&mut self, stmts: &mut Vec<NodeId>, sink: StmtSink, id: NodeId) {
        match sink {
            StmtSink::Top => stmts.push(id),
            StmtSink::IfBody(owner) => match &mut self.slots[owner.index()] {
                Slot::Done(Node::If { body, .. }) => body.push(id),
                _ => unreachable!(),
            },
            StmtSink::IfElse(owner) => match &mut self.slots[owner.index()] {
                Slot::Done(Node::If { els: Some(els), .. }) => els.push(id),
                _ => unreachable!(),
            },
            StmtSink::WhileBody(owner) => match &mut self.slots[owner.index()] {
                Slot::Done(Node::While { body, .. }) => body.push(id),
                _ => unreachable!(),
            },
        }
    }

    fn build_stmts(&mut self, tokens: Vec<Token>, scoped: bool) -> Result<Node, SyntaxError> {
        let mut stmts = Vec::new();
        let mut sink = StmtSink::Top;
        // `if` headers whose statement just closed; `else` attaches to the
        // innermost one.
        let mut prev_if: Vec<NodeId> = Vec::new();
        let mut idx = 0;
        while idx < tokens.len() {
            let kw = match &tokens[idx] {
                Token::Ident(name, _) => Some(name.as_str()),
                _ => None,
            };
            if kw != Some("else") && matches!(sink, StmtSink::Top) {
                prev_if.clear();
            }
            match kw {
                Some(kw @ ("if" | "while")) => {
                    let items = match tokens.get(idx + 1) {
                        Some(Token::Group(g)) if g.kind == GroupKind::Parens => g.items.clone(),
                        _ => {
                            let at = tokens[(tokens.len() - 1).min(idx + 1)].pos();
                            return Err(SyntaxError::at(
                                format!("{kw}: expected parenthesis"),
                                at,
                            ));
                        }
                    };
                    let cond = self.expr(Tier::Assign, items);
                    if kw == "if" {
                        let id = self.done(Node::If {
                            cond,
                            body: Vec::new(),
                            els: None,
                        });
                        self.push_into(&mut stmts, sink, id);
                        prev_if.push(id);
                        sink = StmtSink::IfBody(id);
                    } else {
                        let id = self.done(Node::While {
                            cond,
                            body: Vec::new(),
                        });
                        self.push_into(&mut stmts, sink, id);
                        sink = StmtSink::WhileBody(id);
                    }
                    idx += 2;
                }
                Some("else") => {
                    let Some(prev) = prev_if.pop() else {
                        return Err(SyntaxError::at(
                            "`else' without `if'",
                            tokens[idx].pos(),
                        ));
                    };
                    match &mut self.slots[prev.index()] {
                        Slot::Done(Node::If { els, .. }) => *els = Some(Vec::new()),
                        _ => unreachable!(),
                    }
                    sink = StmtSink::IfElse(prev);
                    idx += 1;
                }
                _ => {
                    if let Token::Group(g) = &tokens[idx] {
                        if g.kind == GroupKind::Brace {
                            let inner = g.items.clone();
                            let id = self.alloc(Slot::Todo(Build::Stmts {
                                tokens: inner,
                                scoped: true,
                            }));
                            self.push_into(&mut stmts, sink, id);
                            sink = StmtSink::Top;
                            idx += 1;
                            continue;
                        }
                    }
                    let mut end = idx;
                    while end < tokens.len() && !is_op(&tokens[end], OpKind::Semi) {
                        end += 1;
                    }
                    if end == tokens.len() {
                        return Err(SyntaxError::at(
                            "expected `;'",
                            tokens[tokens.len() - 1].pos(),
                        ));
                    }
                    let stmt = match kw {
                        Some("var") => {
                            Some(self.build_var_decl(&tokens[idx + 1..end], tokens[idx].pos())?)
                        }
                        Some("delete") => {
                            let target =
                                self.expr(Tier::Assign, tokens[idx + 1..end].to_vec());
                            Some(self.done(Node::Delete {
                                target,
                                pos: tokens[idx].pos(),
                            }))
                        }
                        Some("return") => {
                            let value =
                                self.expr(Tier::Assign, tokens[idx + 1..end].to_vec());
                            Some(self.done(Node::Return { value }))
                        }
                        _ if idx != end => {
                            let expr = self.expr(Tier::Assign, tokens[idx..end].to_vec());
                            Some(self.done(Node::DropExpr { expr }))
                        }
                        _ => None,
                    };
                    if let Some(id) = stmt {
                        self.push_into(&mut stmts, sink, id);
                    }
                    sink = StmtSink::Top;
                    idx = end + 1;
                }
            }
        }
        Ok(Node::Block { stmts, scoped })
    }

    fn build_var_decl(&mut self, data: &[Token], kw_pos: Pos) -> Result<NodeId, SyntaxError> {
        let mut decls = Vec::new();
        let mut idx = 0;
        loop {
            let (name, pos) = match data.get(idx) {
                Some(Token::Ident(name, pos)) => (name.clone(), *pos),
                _ => {
                    let at = data
                        .get(idx.min(data.len().saturating_sub(1)))
                        .map(Token::pos)
                        .unwrap_or(kw_pos);
                    return Err(SyntaxError::at("expected identifier", at));
                }
            };
            if RESERVED.contains(&name.as_str()) {
                return Err(SyntaxError::at(format!("`{name}' unexpected"), pos));
            }
            idx += 1;
            match data.get(idx) {
                None => {
                    decls.push(VarInit {
                        name,
                        pos,
                        init: None,
                    });
                    break;
                }
                Some(Token::Op(OpKind::Comma, _)) => {
                    decls.push(VarInit {
                        name,
                        pos,
                        init: None,
                    });
                    idx += 1;
                    if idx >= data.len() {
                        break;
                    }
                }
                Some(Token::Op(OpKind::Assign, _)) => {
                    idx += 1;
                    let start = idx;
                    while idx < data.len() && !is_op(&data[idx], OpKind::Comma) {
                        idx += 1;
                    }
                    let init = self.expr(Tier::Assign, data[start..idx].to_vec());
                    decls.push(VarInit {
                        name,
                        pos,
                        init: Some(init),
                    });
                    if idx >= data.len() {
                        break;
                    }
                    idx += 1;
                    if idx >= data.len() {
                        break;
                    }
                }
                Some(tok) => {
                    return Err(SyntaxError::at("`=' expected", tok.pos()));
                }
            }
        }
        Ok(self.done(Node::VarDecl { decls }))
    }

    fn build_expr(&mut self, tier: Tier, tokens: Vec<Token>) -> Result<Outcome, SyntaxError> {
        let mut tier = tier;
        loop {
            match tier {
                Tier::Assign => {
                    if let Some(i) = find_right_assoc(&tokens, &[OpKind::Assign]) {
                        let lhs = tokens[..i].to_vec();
                        let rhs = tokens[i + 1..].to_vec();
                        if dotted_name(&lhs).is_none() {
                            return Err(SyntaxError::at(
                                "non-variable in assignment",
                                lhs[0].pos(),
                            ));
                        }
                        let pos = lhs[0].pos();
                        let target = self.expr(Tier::Ternary, lhs);
                        let value = self.expr(Tier::Assign, rhs);
                        return Ok(Outcome::Node(Node::Assign { target, value, pos }));
                    }
                    tier = Tier::Ternary;
                }
                Tier::Ternary => {
                    let found = tokens.iter().position(
                        |t| matches!(t, Token::Group(g) if g.kind == GroupKind::Ternary),
                    );
                    if let Some(i) = found {
                        let Token::Group(group) = &tokens[i] else {
                            unreachable!()
                        };
                        let then_tokens = group.items.clone();
                        let cond = self.expr(Tier::Or, tokens[..i].to_vec());
                        let then = self.expr(Tier::Assign, then_tokens);
                        let els = self.expr(Tier::Ternary, tokens[i + 1..].to_vec());
                        return Ok(Outcome::Node(Node::Ternary { cond, then, els }));
                    }
                    tier = Tier::Or;
                }
                Tier::Or
                | Tier::And
                | Tier::BitOr
                | Tier::BitAnd
                | Tier::Eq
                | Tier::Compare
                | Tier::Shift
                | Tier::AddSub
                | Tier::Mul => {
                    let (ops, next): (&[OpKind], Tier) = match tier {
                        Tier::Or => (&[OpKind::OrOr], Tier::And),
                        Tier::And => (&[OpKind::AndAnd], Tier::BitOr),
                        Tier::BitOr => (&[OpKind::Pipe], Tier::BitAnd),
                        Tier::BitAnd => (&[OpKind::Amp], Tier::Eq),
                        Tier::Eq => (&[OpKind::EqEq, OpKind::BangEq], Tier::Compare),
                        Tier::Compare => (
                            &[OpKind::Gt, OpKind::Ge, OpKind::Lt, OpKind::Le],
                            Tier::Shift,
                        ),
                        Tier::Shift => (&[OpKind::Shl, OpKind::Shr], Tier::AddSub),
                        Tier::AddSub => (&[OpKind::Plus, OpKind::Minus], Tier::Mul),
                        Tier::Mul => {
                            (&[OpKind::Star, OpKind::Slash, OpKind::Percent], Tier::Unary)
                        }
                        _ => unreachable!(),
                    };
                    if let Some((i, kind)) = find_left_assoc(&tokens, ops) {
                        let lhs = self.expr(tier, tokens[..i].to_vec());
                        let rhs = self.expr(next, tokens[i + 1..].to_vec());
                        let node = match kind {
                            OpKind::OrOr => Node::Logic {
                                op: LogicOp::Or,
                                lhs,
                                rhs,
                            },
                            OpKind::AndAnd => Node::Logic {
                                op: LogicOp::And,
                                lhs,
                                rhs,
                            },
                            other => Node::Binary {
                                op: bin_op(other),
                                lhs,
                                rhs,
                            },
                        };
                        return Ok(Outcome::Node(node));
                    }
                    tier = next;
                }
                Tier::Unary => {
                    if tokens.is_empty() {
                        return Err(SyntaxError::new("empty expression"));
                    }
                    if let Token::Op(kind, _) = &tokens[0] {
                        let kind = *kind;
                        if matches!(kind, OpKind::Bang | OpKind::Tilde | OpKind::Minus) {
                            if kind == OpKind::Minus {
                                if let Some(lit) = fold_negated(&tokens[1..]) {
                                    return Ok(Outcome::Node(Node::Literal(lit)));
                                }
                            }
                            let op = match kind {
                                OpKind::Bang => UnOp::Not,
                                OpKind::Tilde => UnOp::Invert,
                                _ => UnOp::Neg,
                            };
                            let expr = self.expr(Tier::Unary, tokens[1..].to_vec());
                            return Ok(Outcome::Node(Node::Unary { op, expr }));
                        }
                    }
                    tier = Tier::Atomic;
                }
                Tier::Atomic => return self.build_atomic(tokens),
            }
        }
    }

    fn build_atomic(&mut self, mut tokens: Vec<Token>) -> Result<Outcome, SyntaxError> {
        if tokens.is_empty() {
            return Err(SyntaxError::new("empty expression"));
        }
        if tokens.len() == 1 {
            return self.build_leaf(tokens);
        }
        if matches!(tokens.last(), Some(Token::Group(g)) if g.kind == GroupKind::Parens) {
            let Some(Token::Group(args)) = tokens.pop() else {
                unreachable!()
            };
            let head = tokens;
            if matches!(head.first(), Some(Token::Ident(name, _)) if name == "API") {
                let Some(name) = dotted_name(&head) else {
                    return Err(SyntaxError::at("invalid API call", args.pos));
                };
                let method = name.strip_prefix("API.").unwrap_or("").to_string();
                let arg = if args.items.is_empty() {
                    None
                } else {
                    Some(self.single_arg(&args)?)
                };
                return Ok(Outcome::Node(Node::ApiCall { method, arg }));
            }
            if head.len() == 1 {
                if let Token::Ident(name, _) = &head[0] {
                    let func = match name.as_str() {
                        "parseInt" => Some(BuiltinFn::ParseInt),
                        "parseDouble" => Some(BuiltinFn::ParseFloat),
                        _ => None,
                    };
                    if let Some(func) = func {
                        if args.items.is_empty() {
                            return Err(SyntaxError::at(
                                "built-in function takes exactly one argument",
                                args.pos,
                            ));
                        }
                        let arg = self.single_arg(&args)?;
                        return Ok(Outcome::Node(Node::Builtin { func, arg }));
                    }
                }
            }
            let name_ok = head.len() > 2
                && is_op(&head[head.len() - 2], OpKind::Dot)
                && matches!(
                    head.last(),
                    Some(Token::Ident(name, _))
                        if !name.starts_with(|c: char| c.is_ascii_digit())
                );
            if !name_ok {
                return Err(SyntaxError::at("invalid method call", args.pos));
            }
            let mut head = head;
            let Some(Token::Ident(name, _)) = head.pop() else {
                unreachable!()
            };
            head.pop();
            let recv = self.expr(Tier::Atomic, head);
            let mut call_args = Vec::new();
            for chunk in split_commas(&args.items) {
                call_args.push(self.expr(Tier::Assign, chunk));
            }
            return Ok(Outcome::Node(Node::MethodCall {
                recv,
                name,
                args: call_args,
            }));
        }
        if matches!(tokens.last(), Some(Token::Group(g)) if g.kind == GroupKind::Bracket) {
            let Some(Token::Group(group)) = tokens.pop() else {
                unreachable!()
            };
            if group.items.is_empty() {
                return Err(SyntaxError::at("empty array subscription", group.pos));
            }
            let recv = self.expr(Tier::Atomic, tokens);
            let index = self.expr(Tier::Assign, group.items);
            return Ok(Outcome::Node(Node::Index { recv, index }));
        }
        let dot_attr = tokens.len() >= 2
            && matches!(
                tokens.last(),
                Some(Token::Ident(name, _))
                    if !name.starts_with(|c: char| c.is_ascii_digit())
            )
            && matches!(
                tokens[tokens.len() - 2],
                Token::Op(OpKind::Dot | OpKind::AtDot, _)
            );
        if dot_attr {
            let Some(Token::Ident(name, _)) = tokens.pop() else {
                unreachable!()
            };
            let Some(Token::Op(op, _)) = tokens.pop() else {
                unreachable!()
            };
            let node = if op == OpKind::Dot {
                let recv = self.expr(Tier::Atomic, tokens);
                Node::AttrGet { recv, name }
            } else {
                let recv = self.expr(Tier::Assign, tokens);
                Node::AttrFilter { recv, name }
            };
            return Ok(Outcome::Node(node));
        }
        // A dotted run of digit identifiers is a float literal, e.g. `1.5`.
        if let Some(name) = dotted_name(&tokens) {
            if let Ok(value) = name.parse::<f64>() {
                return Ok(Outcome::Node(Node::Literal(Literal::Float(value))));
            }
        }
        Err(SyntaxError::at("invalid expression", tokens[0].pos()))
    }

    fn build_leaf(&mut self, tokens: Vec<Token>) -> Result<Outcome, SyntaxError> {
        if tokens.is_empty() {
            return Err(SyntaxError::new("empty expression"));
        }
        if tokens.len() != 1 {
            return Err(SyntaxError::at("invalid expression", tokens[1].pos()));
        }
        let Some(token) = tokens.into_iter().next() else {
            unreachable!()
        };
        match token {
            Token::Op(_, pos) => Err(SyntaxError::at("invalid expression", pos)),
            Token::Ident(name, pos) => {
                if RESERVED.contains(&name.as_str()) {
                    Err(SyntaxError::at(
                        format!("expected identifier, got `{name}'"),
                        pos,
                    ))
                } else if name.chars().all(|c| c.is_ascii_digit()) {
                    Ok(Outcome::Node(Node::Literal(Literal::Int(fold_int(&name)))))
                } else if name.starts_with(|c: char| c.is_ascii_digit()) {
                    Err(SyntaxError::at(format!("invalid number `{name}'"), pos))
                } else {
                    Ok(Outcome::Node(Node::Var { name, pos }))
                }
            }
            Token::Str(value, _) => Ok(Outcome::Node(Node::Literal(Literal::Str(value)))),
            Token::Group(group) => match group.kind {
                GroupKind::Parens => Ok(Outcome::Again(Build::Expr {
                    tier: Tier::Assign,
                    tokens: group.items,
                })),
                GroupKind::Bracket => {
                    let mut items = Vec::new();
                    for chunk in split_commas(&group.items) {
                        items.push(self.expr(Tier::Assign, chunk));
                    }
                    Ok(Outcome::Node(Node::Array { items }))
                }
                GroupKind::Brace => self.build_object(group),
                GroupKind::Ternary | GroupKind::Source => {
                    Err(SyntaxError::at("invalid expression", group.pos))
                }
            },
        }
    }

    fn build_object(&mut self, group: Group) -> Result<Outcome, SyntaxError> {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for chunk in split_commas(&group.items) {
            if chunk.is_empty() {
                return Err(SyntaxError::new("empty expression"));
            }
            if chunk.len() <= 2 || !is_op(&chunk[1], OpKind::Colon) {
                let at = chunk[(chunk.len() - 1).min(1)].pos();
                return Err(SyntaxError::at("invalid object declaration", at));
            }
            let key = match &chunk[0] {
                Token::Ident(name, _) => name.clone(),
                Token::Str(value, _) => value.clone(),
                tok => {
                    return Err(SyntaxError::at("invalid property name", tok.pos()));
                }
            };
            keys.push(key);
            values.push(self.expr(Tier::Assign, chunk[2..].to_vec()));
        }
        Ok(Outcome::Node(Node::Object { keys, values }))
    }

    /// Splits a call argument group that takes at most one argument.
    fn single_arg(&mut self, args: &Group) -> Result<NodeId, SyntaxError> {
        let chunks = split_commas(&args.items);
        for extra in chunks.iter().skip(1) {
            if let Some(tok) = extra.first() {
                return Err(SyntaxError::at(
                    "too many arguments for built-in or API call",
                    tok.pos(),
                ));
            }
        }
        if chunks.len() > 1 {
            return Err(SyntaxError::new("empty expression"));
        }
        match chunks.into_iter().next() {
            Some(first) => Ok(self.expr(Tier::Assign, first)),
            None => Err(SyntaxError::new("empty expression")),
        }
    }
}

/// Splits a token list on top-level commas. A trailing empty chunk is
/// dropped, so `f(a,)` has one argument; any other empty chunk is kept
/// and fails as an empty expression later.
fn split_commas(items: &[Token]) -> Vec<Vec<Token>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for i in 0..=items.len() {
        let at_split = i == items.len() || is_op(&items[i], OpKind::Comma);
        if at_split {
            if start != items.len() {
                chunks.push(items[start..i].to_vec());
            }
            start = i + 1;
        }
    }
    chunks
}

/// Joins a strictly alternating identifier/dot token run into one name,
/// e.g. `a.b.c`. Returns `None` when the run has any other shape.
fn dotted_name(tokens: &[Token]) -> Option<String> {
    if tokens.is_empty() {
        return None;
    }
    let mut out = String::new();
    for (i, tok) in tokens.iter().enumerate() {
        if i % 2 == 0 {
            let Token::Ident(name, _) = tok else {
                return None;
            };
            out.push_str(name);
        } else {
            if !is_op(tok, OpKind::Dot) {
                return None;
            }
            out.push('.');
        }
    }
    Some(out)
}

/// Constant-folds `-` applied to a numeric token run. Integers wrap in
/// 32 bits, so `-5` stores as `4294967291`.
fn fold_negated(rest: &[Token]) -> Option<Literal> {
    let name = dotted_name(rest)?;
    if name.chars().all(|c| c.is_ascii_digit()) {
        Some(Literal::Int(0u32.wrapping_sub(fold_int(&name))))
    } else {
        name.parse::<f64>().ok().map(|v| Literal::Float(-v))
    }
}

fn fold_int(digits: &str) -> u32 {
    let mut value: u32 = 0;
    for c in digits.chars() {
        value = value
            .wrapping_mul(10)
            .wrapping_add(c as u32 - '0' as u32);
    }
    value
}

fn find_left_assoc(tokens: &[Token], ops: &[OpKind]) -> Option<(usize, OpKind)> {
    for i in (1..tokens.len()).rev() {
        if let Token::Op(kind, _) = &tokens[i] {
            if ops.contains(kind) && !matches!(tokens[i - 1], Token::Op(..)) {
                return Some((i, *kind));
            }
        }
    }
    None
}

fn find_right_assoc(tokens: &[Token], ops: &[OpKind]) -> Option<usize> {
    for i in 1..tokens.len() {
        if let Token::Op(kind, _) = &tokens[i] {
            if ops.contains(kind) && !matches!(tokens[i - 1], Token::Op(..)) {
                return Some(i);
            }
        }
    }
    None
}

fn bin_op(kind: OpKind) -> BinOp {
    match kind {
        OpKind::Plus => BinOp::Add,
        OpKind::Minus => BinOp::Sub,
        OpKind::Star => BinOp::Mul,
        OpKind::Slash => BinOp::Div,
        OpKind::Percent => BinOp::Mod,
        OpKind::Amp => BinOp::BitAnd,
        OpKind::Pipe => BinOp::BitOr,
        OpKind::Shl => BinOp::Shl,
        OpKind::Shr => BinOp::Shr,
        OpKind::EqEq => BinOp::Eq,
        OpKind::BangEq => BinOp::Ne,
        OpKind::Ge => BinOp::Ge,
        OpKind::Gt => BinOp::Gt,
        OpKind::Le => BinOp::Le,
        OpKind::Lt => BinOp::Lt,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_stmts(ast: &Ast) -> &[NodeId] {
        match ast.node(ast.root) {
            Node::Block { stmts, .. } => stmts,
            other => panic!("root is not a block: {other:?}"),
        }
    }

    fn single_expr(source: &str) -> (Ast, NodeId) {
        let ast = parse(source).expect("parse");
        let stmts = root_stmts(&ast);
        assert_eq!(stmts.len(), 1);
        let id = match ast.node(stmts[0]) {
            Node::Return { value } => *value,
            Node::DropExpr { expr } => *expr,
            other => panic!("unexpected statement: {other:?}"),
        };
        (ast, id)
    }

    fn err_message(source: &str) -> String {
        parse(source).expect_err("expected parse error").message
    }

    #[test]
    fn lexes_nested_groups() {
        let root = lex("a(b[c]{d})").expect("lex");
        assert_eq!(root.items.len(), 2);
        let Token::Group(parens) = &root.items[1] else {
            panic!("expected group");
        };
        assert_eq!(parens.kind, GroupKind::Parens);
        assert_eq!(parens.items.len(), 3);
        assert!(matches!(&parens.items[1], Token::Group(g) if g.kind == GroupKind::Bracket));
        assert!(matches!(&parens.items[2], Token::Group(g) if g.kind == GroupKind::Brace));
    }

    #[test]
    fn lexes_ternary_as_group() {
        let root = lex("a ? b : c").expect("lex");
        assert_eq!(root.items.len(), 3);
        let Token::Group(group) = &root.items[1] else {
            panic!("expected ternary group");
        };
        assert_eq!(group.kind, GroupKind::Ternary);
        assert!(matches!(&group.items[0], Token::Ident(name, _) if name == "b"));
    }

    #[test]
    fn colon_in_braces_is_an_operator() {
        let root = lex("{a: 1}").expect("lex");
        let Token::Group(group) = &root.items[0] else {
            panic!("expected brace group");
        };
        assert_eq!(group.kind, GroupKind::Brace);
        assert!(is_op(&group.items[1], OpKind::Colon));
    }

    #[test]
    fn lexes_compound_operators() {
        let root = lex("a >> b >= c == d").expect("lex");
        assert!(is_op(&root.items[1], OpKind::Shr));
        assert!(is_op(&root.items[3], OpKind::Ge));
        assert!(is_op(&root.items[5], OpKind::EqEq));
    }

    #[test]
    fn decodes_string_escapes() {
        let root = lex(r#""a\nb""#).expect("lex");
        assert!(matches!(&root.items[0], Token::Str(s, _) if s == "a\nb"));
    }

    #[test]
    fn single_quoted_string_keeps_double_quotes() {
        let root = lex(r#"'say "hi"'"#).expect("lex");
        assert!(matches!(&root.items[0], Token::Str(s, _) if s == "say \"hi\""));
    }

    #[test]
    fn skips_comments() {
        let root = lex("a // one\nb /* two */ c").expect("lex");
        assert_eq!(root.items.len(), 3);
        assert!(matches!(&root.items[2], Token::Ident(name, _) if name == "c"));
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = lex("a ^ b").expect_err("lex error");
        assert_eq!(err.message, "unknown operator: ^");
        let err = lex("@x").expect_err("lex error");
        assert_eq!(err.message, "unknown operator: @");
    }

    #[test]
    fn rejects_mismatched_brackets() {
        let err = lex("(]").expect_err("lex error");
        assert_eq!(err.message, "non-matching bracket");
        let err = lex("(a").expect_err("lex error");
        assert_eq!(err.message, "unexpected EOF while parsing");
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = lex("\"abc").expect_err("lex error");
        assert_eq!(err.message, "unexpected EOL while parsing");
    }

    #[test]
    fn rejects_bad_string_escape() {
        let err = lex(r#""a\qb""#).expect_err("lex error");
        assert_eq!(err.message, r"invalid string literal: a\qb");
    }

    #[test]
    fn parses_assignment() {
        let (ast, id) = single_expr("x = 1;");
        let Node::Assign { target, value, .. } = ast.node(id) else {
            panic!("expected assignment");
        };
        assert!(matches!(ast.node(*target), Node::Var { name, .. } if name == "x"));
        assert!(matches!(
            ast.node(*value),
            Node::Literal(Literal::Int(1))
        ));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let (ast, id) = single_expr("return 1 + 2 * 3;");
        let Node::Binary { op: BinOp::Add, lhs, rhs } = ast.node(id) else {
            panic!("expected addition at the top");
        };
        assert!(matches!(ast.node(*lhs), Node::Literal(Literal::Int(1))));
        assert!(matches!(
            ast.node(*rhs),
            Node::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn subtraction_is_left_associative() {
        let (ast, id) = single_expr("return 10 - 4 - 3;");
        let Node::Binary { op: BinOp::Sub, lhs, .. } = ast.node(id) else {
            panic!("expected subtraction at the top");
        };
        assert!(matches!(
            ast.node(*lhs),
            Node::Binary { op: BinOp::Sub, .. }
        ));
    }

    #[test]
    fn else_binds_to_nearest_if() {
        let ast = parse("if (a) if (b) x = 1; else x = 2;").expect("parse");
        let stmts = root_stmts(&ast);
        assert_eq!(stmts.len(), 1);
        let Node::If { body, els: None, .. } = ast.node(stmts[0]) else {
            panic!("outer if must have no else");
        };
        assert_eq!(body.len(), 1);
        let Node::If { els: Some(els), .. } = ast.node(body[0]) else {
            panic!("inner if must own the else");
        };
        assert_eq!(els.len(), 1);
    }

    #[test]
    fn else_after_intervening_statement_is_rejected() {
        assert_eq!(err_message("if (a) x = 1; y = 2; else x = 3;"), "`else' without `if'");
    }

    #[test]
    fn statement_requires_semicolon() {
        assert_eq!(err_message("x = 1"), "expected `;'");
    }

    #[test]
    fn if_requires_parenthesized_condition() {
        assert_eq!(err_message("if x;"), "if: expected parenthesis");
        assert_eq!(err_message("while {};"), "while: expected parenthesis");
    }

    #[test]
    fn parses_var_decl_list() {
        let ast = parse("var a = 1, b, c = 2;").expect("parse");
        let stmts = root_stmts(&ast);
        let Node::VarDecl { decls } = ast.node(stmts[0]) else {
            panic!("expected var decl");
        };
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].name, "a");
        assert!(decls[0].init.is_some());
        assert_eq!(decls[1].name, "b");
        assert!(decls[1].init.is_none());
        assert_eq!(decls[2].name, "c");
        assert!(decls[2].init.is_some());
    }

    #[test]
    fn rejects_reserved_variable_name() {
        assert_eq!(err_message("var if;"), "`if' unexpected");
        assert_eq!(err_message("return return;"), "expected identifier, got `return'");
    }

    #[test]
    fn folds_negative_literals() {
        let (ast, id) = single_expr("return -5;");
        assert!(matches!(
            ast.node(id),
            Node::Literal(Literal::Int(v)) if *v == 0u32.wrapping_sub(5)
        ));
        let (ast, id) = single_expr("return -1.5;");
        assert!(matches!(
            ast.node(id),
            Node::Literal(Literal::Float(v)) if *v == -1.5
        ));
    }

    #[test]
    fn dotted_digits_parse_as_float() {
        let (ast, id) = single_expr("return 1.5;");
        assert!(matches!(
            ast.node(id),
            Node::Literal(Literal::Float(v)) if *v == 1.5
        ));
    }

    #[test]
    fn large_int_literal_wraps() {
        let (ast, id) = single_expr("return 4294967296;");
        assert!(matches!(ast.node(id), Node::Literal(Literal::Int(0))));
    }

    #[test]
    fn parses_attribute_chain() {
        let (ast, id) = single_expr("return a.b.c;");
        let Node::AttrGet { recv, name } = ast.node(id) else {
            panic!("expected attribute access");
        };
        assert_eq!(name, "c");
        assert!(matches!(ast.node(*recv), Node::AttrGet { name, .. } if name == "b"));
    }

    #[test]
    fn parses_method_call() {
        let (ast, id) = single_expr("a.push(1, 2);");
        let Node::MethodCall { recv, name, args } = ast.node(id) else {
            panic!("expected method call");
        };
        assert_eq!(name, "push");
        assert_eq!(args.len(), 2);
        assert!(matches!(ast.node(*recv), Node::Var { name, .. } if name == "a"));
    }

    #[test]
    fn parses_api_call() {
        let (ast, id) = single_expr("return API.users.get(x);");
        let Node::ApiCall { method, arg } = ast.node(id) else {
            panic!("expected API call");
        };
        assert_eq!(method, "users.get");
        assert!(arg.is_some());
        let (ast, id) = single_expr("return API.storage.keys();");
        let Node::ApiCall { arg, .. } = ast.node(id) else {
            panic!("expected API call");
        };
        assert!(arg.is_none());
        assert!(matches!(ast.node(id), Node::ApiCall { .. }));
    }

    #[test]
    fn builtin_requires_exactly_one_argument() {
        assert_eq!(
            err_message("parseInt();"),
            "built-in function takes exactly one argument"
        );
        assert_eq!(
            err_message("parseInt(a, b);"),
            "too many arguments for built-in or API call"
        );
    }

    #[test]
    fn rejects_non_variable_assignment() {
        assert_eq!(err_message("(a) = 1;"), "non-variable in assignment");
        assert_eq!(err_message("a[0] = 1;"), "non-variable in assignment");
    }

    #[test]
    fn parses_object_literal() {
        let (ast, id) = single_expr(r#"return {a: 1, "b c": 2};"#);
        let Node::Object { keys, values } = ast.node(id) else {
            panic!("expected object literal");
        };
        assert_eq!(keys, &["a".to_string(), "b c".to_string()]);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn rejects_bad_object_literal() {
        assert_eq!(err_message("return {[0]: 2};"), "invalid property name");
        assert_eq!(err_message("return {a};"), "invalid object declaration");
    }

    #[test]
    fn ternary_nests_to_the_right() {
        let (ast, id) = single_expr("return a ? b : c ? d : e;");
        let Node::Ternary { els, .. } = ast.node(id) else {
            panic!("expected ternary");
        };
        assert!(matches!(ast.node(*els), Node::Ternary { .. }));
    }

    #[test]
    fn parses_attr_filter() {
        let (ast, id) = single_expr("return items@.id;");
        let Node::AttrFilter { name, .. } = ast.node(id) else {
            panic!("expected attribute filter");
        };
        assert_eq!(name, "id");
    }

    #[test]
    fn rejects_empty_subscription() {
        assert_eq!(err_message("return a[];"), "empty array subscription");
        assert_eq!(err_message("return f();"), "invalid method call");
    }

    #[test]
    fn parses_deeply_nested_parens() {
        let source = format!("return {}1{};", "(".repeat(500), ")".repeat(500));
        let (ast, id) = single_expr(&source);
        assert!(matches!(ast.node(id), Node::Literal(Literal::Int(1))));
    }

    #[test]
    fn trailing_comma_in_array_is_ignored() {
        let (ast, id) = single_expr("return [1, 2,];");
        let Node::Array { items } = ast.node(id) else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
    }
}

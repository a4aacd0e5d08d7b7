//! The recursive-descent parser.
//!
//! Single pass: grammar rules call code-generation primitives directly,
//! handing expression descriptors back and forth. No syntax tree is
//! built.

use luna_bytecode::instruction::{MAXARG_BX, NO_JUMP};
use luna_bytecode::proto::{var_kind, UpvalDesc};
use luna_bytecode::{Closure, OpCode};
use luna_common::{limits, LunaResult, LuaStr};
use luna_lexer::{ByteReader, Lexer, Token};

use luna_codegen::code::MULTRET;
use luna_codegen::func_state::{BL_LOOP, BL_NOT_LOOP};
use luna_codegen::scope::break_label_name;
use luna_codegen::{BinOp, Compiler, ExpDesc, ExpKind, UnOp};

/// Maximum number of elements in a constructor.
const MAX_CNST: i32 = i32::MAX / 2;

/// Priority for unary operators.
const UNARY_PRIORITY: u8 = 12;

/// Left/right binding priorities, indexed by `BinOp`.
#[rustfmt::skip]
const PRIORITY: [(u8, u8); 21] = [
    (10, 10), (10, 10),           // '+' '-'
    (11, 11), (11, 11),           // '*' '%'
    (14, 13),                     // '^' (right associative)
    (11, 11), (11, 11),           // '/' '//'
    (6, 6), (4, 4), (5, 5),       // '&' '|' '~'
    (7, 7), (7, 7),               // '<<' '>>'
    (9, 8),                       // '..' (right associative)
    (3, 3), (3, 3), (3, 3),       // '==' '<' '<='
    (3, 3), (3, 3), (3, 3),       // '~=' '>' '>='
    (2, 2), (1, 1),               // 'and' 'or'
];

fn unop_of(t: &Token) -> Option<UnOp> {
    match t {
        Token::Not => Some(UnOp::Not),
        Token::Char(b'-') => Some(UnOp::Minus),
        Token::Char(b'~') => Some(UnOp::BNot),
        Token::Char(b'#') => Some(UnOp::Len),
        _ => None,
    }
}

fn binop_of(t: &Token) -> Option<BinOp> {
    match t {
        Token::Char(b'+') => Some(BinOp::Add),
        Token::Char(b'-') => Some(BinOp::Sub),
        Token::Char(b'*') => Some(BinOp::Mul),
        Token::Char(b'%') => Some(BinOp::Mod),
        Token::Char(b'^') => Some(BinOp::Pow),
        Token::Char(b'/') => Some(BinOp::Div),
        Token::IDiv => Some(BinOp::IDiv),
        Token::Char(b'&') => Some(BinOp::BAnd),
        Token::Char(b'|') => Some(BinOp::BOr),
        Token::Char(b'~') => Some(BinOp::BXor),
        Token::Shl => Some(BinOp::Shl),
        Token::Shr => Some(BinOp::Shr),
        Token::Concat => Some(BinOp::Concat),
        Token::Ne => Some(BinOp::Ne),
        Token::Eq => Some(BinOp::Eq),
        Token::Char(b'<') => Some(BinOp::Lt),
        Token::Le => Some(BinOp::Le),
        Token::Char(b'>') => Some(BinOp::Gt),
        Token::Ge => Some(BinOp::Ge),
        Token::And => Some(BinOp::And),
        Token::Or => Some(BinOp::Or),
        _ => None,
    }
}

/// Constructor bookkeeping.
struct ConsControl {
    /// Last list item read.
    v: ExpDesc,
    /// Register holding the table.
    table_reg: u32,
    /// Total number of record elements.
    nh: i32,
    /// Number of array elements already stored.
    na: i32,
    /// Number of array elements pending storage.
    tostore: i32,
    /// Flush threshold for pending elements.
    max_to_store: i32,
}

pub struct Parser<'a> {
    lex: Lexer<'a>,
    c: Compiler,
    depth: usize,
    env_name: LuaStr,
}

/// Compile a text chunk. `first` is the already-read first byte of the
/// stream (from the binary-signature sniff).
pub fn compile(reader: ByteReader, chunk_name: &str, first: Option<u8>) -> LunaResult<Closure> {
    let mut lex = Lexer::with_first(reader, chunk_name, first)?;
    let env_name = lex.intern_str("_ENV");
    let mut parser = Parser { lex, c: Compiler::new(chunk_name), depth: 0, env_name };
    parser.main_func()
}

impl<'a> Parser<'a> {
    // ---------------------------------------------------------------
    // Token plumbing
    // ---------------------------------------------------------------

    fn next(&mut self) -> LunaResult<()> {
        self.lex.next_token()?;
        self.c.lastline = self.lex.last_line();
        Ok(())
    }

    fn tok(&self) -> &Token {
        self.lex.current_token()
    }

    fn test_next(&mut self, t: &Token) -> LunaResult<bool> {
        if self.tok().same_kind(t) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn error_expected(&self, t: &Token) -> luna_common::LunaError {
        self.lex.syntax_error(&format!("{} expected", t.describe()))
    }

    fn check(&self, t: &Token) -> LunaResult<()> {
        if !self.tok().same_kind(t) {
            return Err(self.error_expected(t));
        }
        Ok(())
    }

    fn check_next(&mut self, t: &Token) -> LunaResult<()> {
        self.check(t)?;
        self.next()
    }

    /// Check for `what`, reporting where the construct it closes began.
    fn check_match(&mut self, what: &Token, who: &Token, where_line: u32) -> LunaResult<()> {
        if !self.test_next(what)? {
            if where_line == self.lex.line_number() {
                return Err(self.error_expected(what));
            }
            return Err(self.lex.syntax_error(&format!(
                "{} expected (to close {} at line {})",
                what.describe(),
                who.describe(),
                where_line
            )));
        }
        Ok(())
    }

    fn check_name(&mut self) -> LunaResult<LuaStr> {
        match self.tok() {
            Token::Name(s) => {
                let s = s.clone();
                self.next()?;
                Ok(s)
            }
            _ => Err(self.lex.syntax_error("<name> expected")),
        }
    }

    fn check_condition(&self, cond: bool, msg: &str) -> LunaResult<()> {
        if !cond {
            return Err(self.lex.syntax_error(msg));
        }
        Ok(())
    }

    fn enter_level(&mut self) -> LunaResult<()> {
        self.depth += 1;
        if self.depth >= limits::MAX_PARSER_DEPTH {
            return Err(self.lex.syntax_error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    // ---------------------------------------------------------------
    // Variables
    // ---------------------------------------------------------------

    /// Build the expression `_ENV[varname]` in `var`.
    fn build_global(&mut self, varname: &LuaStr, var: &mut ExpDesc) -> LunaResult<()> {
        let env = self.env_name.clone();
        self.c.resolve_var(&env, var)?; // get environment variable
        if matches!(var.kind, ExpKind::Global(_)) {
            return Err(self.c.sem_error(&format!(
                "_ENV is global when accessing variable '{}'",
                varname.display()
            )));
        }
        self.c.exp_to_any_reg_up(var)?; // _ENV could be a constant
        let mut key = ExpDesc::string(varname.clone());
        self.c.indexed(var, &mut key)?; // 'var' represents _ENV[varname]
        Ok(())
    }

    /// Resolve `varname`, handling globals and their declarations.
    fn build_var(&mut self, varname: &LuaStr, var: &mut ExpDesc) -> LunaResult<()> {
        self.c.resolve_var(varname, var)?;
        if let ExpKind::Global(info) = var.kind {
            if info == -2 {
                // undeclared name under an active collective declaration
                return Err(self
                    .c
                    .sem_error(&format!("variable '{}' not declared", varname.display())));
            }
            self.build_global(varname, var)?;
            if info >= 0 && self.c.dyd.actvar[info as usize].kind == var_kind::GDKCONST {
                Compiler::mark_read_only(var); // declared with <const>
            }
        }
        Ok(())
    }

    fn single_var(&mut self, var: &mut ExpDesc) -> LunaResult<()> {
        let name = self.check_name()?;
        self.build_var(&name, var)
    }

    /// Reject assignment to a const or read-only variable.
    fn check_readonly(&self, e: &ExpDesc) -> LunaResult<()> {
        let varname: Option<LuaStr> = match &e.kind {
            ExpKind::Const(vidx) => self.c.dyd.actvar[*vidx as usize].name.clone(),
            ExpKind::Local { vidx, .. } => {
                let vd = self.c.local_var(*vidx);
                if vd.kind != var_kind::VDKREG {
                    vd.name.clone()
                } else {
                    None
                }
            }
            ExpKind::Upval(idx) => {
                let up = &self.c.fs().proto.upvalues[*idx as usize];
                if up.kind != var_kind::VDKREG {
                    up.name.clone()
                } else {
                    None
                }
            }
            ExpKind::IndexUp { key_str, read_only, .. }
            | ExpKind::IndexStr { key_str, read_only, .. }
            | ExpKind::Indexed { key_str, read_only, .. } => {
                if *read_only {
                    match &self.c.fs().proto.constants[*key_str as usize] {
                        luna_bytecode::Value::Str(s) => Some(s.clone()),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            // an integer index cannot be read-only
            ExpKind::IndexI { .. } => None,
            k => unreachable!("not a variable: {:?}", k),
        };
        if let Some(name) = varname {
            return Err(self.c.sem_error(&format!(
                "attempt to assign to const variable '{}'",
                name.display()
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Function bodies
    // ---------------------------------------------------------------

    fn parlist(&mut self) -> LunaResult<()> {
        let mut nparams = 0usize;
        let mut is_vararg = false;
        if !self.tok().is_char(b')') {
            loop {
                match self.tok().clone() {
                    Token::Name(name) => {
                        self.next()?;
                        self.c.new_local_var(name);
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.next()?;
                        is_vararg = true;
                    }
                    _ => return Err(self.lex.syntax_error("<name> or '...' expected")),
                }
                if is_vararg || !self.test_next(&Token::Char(b','))? {
                    break;
                }
            }
        }
        self.c.adjust_local_vars(nparams)?;
        let nactive = self.c.fs().nactvar;
        self.c.fs_mut().proto.num_params = nactive as u8;
        if is_vararg {
            self.c.set_vararg(nactive as u32)?; // declared vararg
        }
        self.c.reserve_regs(nactive as u32)?; // registers for parameters
        Ok(())
    }

    /// `body -> '(' parlist ')' block END`; compiles the nested function
    /// and leaves the closure in the returned expression.
    fn body(&mut self, is_method: bool, line: u32) -> LunaResult<ExpDesc> {
        let source = self.lex.source().clone();
        self.c.open_func(Some(source), line);
        self.check_next(&Token::Char(b'('))?;
        if is_method {
            let self_name = self.lex.intern_str("self");
            self.c.new_local_var(self_name); // implicit 'self' parameter
            self.c.adjust_local_vars(1)?;
        }
        self.parlist()?;
        self.check_next(&Token::Char(b')'))?;
        self.statlist()?;
        self.c.fs_mut().proto.last_line_defined = self.lex.line_number();
        self.check_match(&Token::End, &Token::Function, line)?;
        let proto = self.c.close_func()?;
        // attach the child and code the closure in the parent; CLOSURE
        // uses the next register so the allocator state stays exact
        self.c.fs_mut().proto.protos.push(proto);
        let np = self.c.fs().proto.protos.len() - 1;
        self.c.check_limit(np, MAXARG_BX as usize, "functions")?;
        let pc = self.c.code_abx(OpCode::Closure, 0, np as u32)?;
        let mut e = ExpDesc::new(ExpKind::Reloc(pc));
        self.c.exp_to_next_reg(&mut e)?;
        Ok(e)
    }

    // ---------------------------------------------------------------
    // Expression lists and call arguments
    // ---------------------------------------------------------------

    fn explist(&mut self, v: &mut ExpDesc) -> LunaResult<usize> {
        let mut n = 1; // at least one expression
        self.expr(v)?;
        while self.test_next(&Token::Char(b','))? {
            self.c.exp_to_next_reg(v)?;
            self.expr(v)?;
            n += 1;
        }
        Ok(n)
    }

    fn funcargs(&mut self, f: &mut ExpDesc) -> LunaResult<()> {
        let line = self.lex.line_number();
        let mut args = ExpDesc::void();
        match self.tok().clone() {
            Token::Char(b'(') => {
                self.next()?;
                if self.tok().is_char(b')') {
                    args.set(ExpKind::Void); // empty argument list
                } else {
                    self.explist(&mut args)?;
                    if args.has_multret() {
                        self.c.set_returns(&args, MULTRET)?;
                    }
                }
                self.check_match(&Token::Char(b')'), &Token::Char(b'('), line)?;
            }
            Token::Char(b'{') => {
                self.constructor(&mut args)?;
            }
            Token::Str(s) => {
                args = ExpDesc::string(s);
                self.next()?;
            }
            _ => return Err(self.lex.syntax_error("function arguments expected")),
        }
        debug_assert!(matches!(f.kind, ExpKind::NonReloc(_)));
        let base = f.reg(); // base register for the call
        let nparams: i32;
        if args.has_multret() {
            nparams = MULTRET; // open call
        } else {
            if !matches!(args.kind, ExpKind::Void) {
                self.c.exp_to_next_reg(&mut args)?; // close last argument
            }
            nparams = (self.c.fs().freereg - (base + 1)) as i32;
        }
        let pc = self.c.code_abc(OpCode::Call, base, (nparams + 1) as u32, 2)?;
        f.init(ExpKind::Call(pc));
        self.c.fix_line(line);
        // the call removes function and arguments, leaving one result
        // (unless changed later)
        self.c.fs_mut().freereg = base + 1;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Constructors
    // ---------------------------------------------------------------

    fn field_sel(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        // fieldsel -> ['.' | ':'] NAME
        self.c.exp_to_any_reg_up(v)?;
        self.next()?; // skip the dot or colon
        let name = self.check_name()?;
        let mut key = ExpDesc::string(name);
        self.c.indexed(v, &mut key)
    }

    fn yindex(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        // index -> '[' expr ']'
        self.next()?; // skip the '['
        self.expr(v)?;
        self.c.exp_to_val(v)?;
        self.check_next(&Token::Char(b']'))
    }

    fn rec_field(&mut self, cc: &mut ConsControl) -> LunaResult<()> {
        // recfield -> (NAME | '[' exp ']') = exp
        let reg = self.c.fs().freereg;
        let mut key = ExpDesc::void();
        if matches!(self.tok(), Token::Name(_)) {
            let name = self.check_name()?;
            key = ExpDesc::string(name);
        } else {
            self.yindex(&mut key)?;
        }
        cc.nh += 1;
        self.check_next(&Token::Char(b'='))?;
        let mut tab = ExpDesc::new(ExpKind::NonReloc(cc.table_reg));
        self.c.indexed(&mut tab, &mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        self.c.store_var(&tab, &mut val)?;
        self.c.fs_mut().freereg = reg; // free registers
        Ok(())
    }

    fn list_field(&mut self, cc: &mut ConsControl) -> LunaResult<()> {
        self.expr(&mut cc.v)?;
        cc.tostore += 1;
        Ok(())
    }

    fn field(&mut self, cc: &mut ConsControl) -> LunaResult<()> {
        // field -> listfield | recfield
        match self.tok() {
            Token::Name(_) => {
                // expression, unless followed by '='
                if !self.lex.lookahead()?.is_char(b'=') {
                    self.list_field(cc)
                } else {
                    self.rec_field(cc)
                }
            }
            Token::Char(b'[') => self.rec_field(cc),
            _ => self.list_field(cc),
        }
    }

    fn close_list_field(&mut self, cc: &mut ConsControl) -> LunaResult<()> {
        debug_assert!(cc.tostore > 0);
        self.c.exp_to_next_reg(&mut cc.v)?;
        cc.v.set(ExpKind::Void);
        if cc.tostore >= cc.max_to_store {
            self.c.set_list(cc.table_reg, cc.na, cc.tostore)?; // flush
            cc.na += cc.tostore;
            cc.tostore = 0; // no more items pending
        }
        Ok(())
    }

    fn last_list_field(&mut self, cc: &mut ConsControl) -> LunaResult<()> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.has_multret() {
            self.c.set_returns(&cc.v, MULTRET)?;
            self.c.set_list(cc.table_reg, cc.na, MULTRET)?;
            cc.na -= 1; // do not count the last expression
        } else {
            if !matches!(cc.v.kind, ExpKind::Void) {
                self.c.exp_to_next_reg(&mut cc.v)?;
            }
            self.c.set_list(cc.table_reg, cc.na, cc.tostore)?;
        }
        cc.na += cc.tostore;
        Ok(())
    }

    fn constructor(&mut self, t: &mut ExpDesc) -> LunaResult<()> {
        // constructor -> '{' [ field { sep field } [sep] ] '}'
        //   sep -> ',' | ';'
        let line = self.lex.line_number();
        let pc = self.c.code_vabck(OpCode::NewTable, 0, 0, 0, 0)?;
        self.c.code(luna_bytecode::Instruction::ax(OpCode::ExtraArg, 0))?; // space for extra arg
        let table_reg = self.c.fs().freereg;
        t.init(ExpKind::NonReloc(table_reg)); // table at stack top
        self.c.reserve_regs(1)?;
        let mut cc = ConsControl {
            v: ExpDesc::void(),
            table_reg,
            nh: 0,
            na: 0,
            tostore: 0,
            max_to_store: 0,
        };
        self.check_next(&Token::Char(b'{'))?;
        cc.max_to_store = self.c.max_to_store();
        loop {
            if self.tok().is_char(b'}') {
                break;
            }
            if !matches!(cc.v.kind, ExpKind::Void) {
                self.close_list_field(&mut cc)?; // close the previous item
            }
            self.field(&mut cc)?;
            self.c.check_limit(
                (cc.tostore + cc.na + cc.nh) as usize,
                MAX_CNST as usize,
                "items in a constructor",
            )?;
            if !(self.test_next(&Token::Char(b','))? || self.test_next(&Token::Char(b';'))?) {
                break;
            }
        }
        self.check_match(&Token::Char(b'}'), &Token::Char(b'{'), line)?;
        self.last_list_field(&mut cc)?;
        self.c.set_table_size(pc, t.reg(), cc.na as u32, cc.nh as u32);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn primary_exp(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        // primaryexp -> NAME | '(' expr ')'
        match self.tok() {
            Token::Char(b'(') => {
                let line = self.lex.line_number();
                self.next()?;
                self.expr(v)?;
                self.check_match(&Token::Char(b')'), &Token::Char(b'('), line)?;
                self.c.discharge_vars(v)
            }
            Token::Name(_) => self.single_var(v),
            _ => Err(self.lex.syntax_error("unexpected symbol")),
        }
    }

    fn suffixed_exp(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        // suffixedexp ->
        //   primaryexp { '.' NAME | '[' exp ']' | ':' NAME funcargs | funcargs }
        self.primary_exp(v)?;
        loop {
            match self.tok() {
                Token::Char(b'.') => self.field_sel(v)?,
                Token::Char(b'[') => {
                    self.c.exp_to_any_reg_up(v)?;
                    let mut key = ExpDesc::void();
                    self.yindex(&mut key)?;
                    self.c.indexed(v, &mut key)?;
                }
                Token::Char(b':') => {
                    self.next()?;
                    let name = self.check_name()?;
                    let mut key = ExpDesc::string(name);
                    self.c.op_self(v, &mut key)?;
                    self.funcargs(v)?;
                }
                Token::Char(b'(') | Token::Str(_) | Token::Char(b'{') => {
                    self.c.exp_to_next_reg(v)?;
                    self.funcargs(v)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn simple_exp(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        // simpleexp -> FLT | INT | STRING | NIL | TRUE | FALSE | '...' |
        //              constructor | FUNCTION body | suffixedexp
        match self.tok().clone() {
            Token::Flt(f) => v.init(ExpKind::KFlt(f)),
            Token::Int(i) => v.init(ExpKind::KInt(i)),
            Token::Str(s) => v.init(ExpKind::KStr(s)),
            Token::Nil => v.init(ExpKind::Nil),
            Token::True => v.init(ExpKind::True),
            Token::False => v.init(ExpKind::False),
            Token::Dots => {
                // vararg
                self.check_condition(
                    self.c.fs().proto.is_vararg(),
                    "cannot use '...' outside a vararg function",
                )?;
                let pc = self.c.code_abc(OpCode::Vararg, 0, 0, 1)?;
                v.init(ExpKind::Vararg(pc));
            }
            Token::Char(b'{') => {
                return self.constructor(v);
            }
            Token::Function => {
                self.next()?;
                let line = self.lex.line_number();
                *v = self.body(false, line)?;
                return Ok(());
            }
            _ => {
                return self.suffixed_exp(v);
            }
        }
        self.next()
    }

    /// `subexpr -> (simpleexp | unop subexpr) { binop subexpr }`, where
    /// operators are consumed while their left priority exceeds `limit`.
    /// Returns the first unhandled operator.
    fn subexpr(&mut self, v: &mut ExpDesc, limit: u8) -> LunaResult<Option<BinOp>> {
        self.enter_level()?;
        if let Some(uop) = unop_of(self.tok()) {
            let line = self.lex.line_number();
            self.next()?; // skip operator
            self.subexpr(v, UNARY_PRIORITY)?;
            self.c.prefix(uop, v, line)?;
        } else {
            self.simple_exp(v)?;
        }
        let mut op = binop_of(self.tok());
        while let Some(binop) = op {
            if PRIORITY[binop as usize].0 <= limit {
                break;
            }
            let line = self.lex.line_number();
            self.next()?; // skip operator
            self.c.infix(binop, v)?;
            let mut v2 = ExpDesc::void();
            let next_op = self.subexpr(&mut v2, PRIORITY[binop as usize].1)?;
            self.c.posfix(binop, v, &mut v2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok(op)
    }

    fn expr(&mut self, v: &mut ExpDesc) -> LunaResult<()> {
        self.subexpr(v, 0)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    /// Whether the current token closes a block (`until` only when
    /// `with_until` holds, since it does not close the scope).
    fn block_follow(&self, with_until: bool) -> bool {
        match self.tok() {
            Token::Else | Token::Elseif | Token::End | Token::Eos => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    fn statlist(&mut self) -> LunaResult<()> {
        // statlist -> { stat [';'] }
        while !self.block_follow(true) {
            if matches!(self.tok(), Token::Return) {
                self.statement()?;
                return Ok(()); // 'return' must be the last statement
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block(&mut self) -> LunaResult<()> {
        // block -> statlist
        self.c.enter_block(BL_NOT_LOOP);
        self.statlist()?;
        self.c.leave_block()
    }

    /// In a multiple assignment to an upvalue or local, check whether a
    /// previous LHS indexes through it; if so, redirect that LHS to a
    /// safe copy made at the top of the register file.
    fn check_conflict(&mut self, lhs: &mut [ExpDesc], v: &ExpDesc) -> LunaResult<()> {
        let extra = self.c.fs().freereg; // slot to save the value, if needed
        let mut conflict = false;
        for lh in lhs.iter_mut() {
            match &mut lh.kind {
                ExpKind::IndexUp { table, idx, key_str, read_only } => {
                    if let ExpKind::Upval(up) = v.kind {
                        if *table == up {
                            // the table is the upvalue being assigned now
                            conflict = true;
                            lh.kind = ExpKind::IndexStr {
                                table: extra, // assignment uses the safe copy
                                idx: *idx,
                                key_str: *key_str,
                                read_only: *read_only,
                            };
                        }
                    }
                }
                ExpKind::Indexed { table, idx, .. } => {
                    if let ExpKind::Local { reg, .. } = v.kind {
                        if *table == reg {
                            conflict = true;
                            *table = extra;
                        }
                        if *idx == reg {
                            // the index is the local being assigned
                            conflict = true;
                            *idx = extra;
                        }
                    }
                }
                ExpKind::IndexStr { table, .. } | ExpKind::IndexI { table, .. } => {
                    if let ExpKind::Local { reg, .. } = v.kind {
                        if *table == reg {
                            conflict = true;
                            *table = extra;
                        }
                    }
                }
                _ => {}
            }
        }
        if conflict {
            // copy the upvalue/local value to a temporary
            match v.kind {
                ExpKind::Local { reg, .. } => {
                    self.c.code_abc(OpCode::Move, extra, reg, 0)?;
                }
                ExpKind::Upval(idx) => {
                    self.c.code_abc(OpCode::GetUpval, extra, idx, 0)?;
                }
                _ => unreachable!(),
            }
            self.c.reserve_regs(1)?;
        }
        Ok(())
    }

    /// `restassign -> ',' suffixedexp restassign | '=' explist`.
    /// `lhs[level]` is the variable assigned at this recursion level.
    fn rest_assign(&mut self, lhs: &mut Vec<ExpDesc>, level: usize) -> LunaResult<()> {
        self.check_condition(lhs[level].is_var(), "syntax error")?;
        self.check_readonly(&lhs[level])?;
        if self.test_next(&Token::Char(b','))? {
            let mut nv = ExpDesc::void();
            self.suffixed_exp(&mut nv)?;
            if !nv.is_indexed() {
                self.check_conflict(&mut lhs[..=level], &nv)?;
            }
            lhs.push(nv);
            self.enter_level()?; // control recursion depth
            self.rest_assign(lhs, level + 1)?;
            self.leave_level();
        } else {
            self.check_next(&Token::Char(b'='))?;
            let mut e = ExpDesc::void();
            let nexps = self.explist(&mut e)?;
            if nexps != level + 1 {
                self.adjust_values(level + 1, nexps, &mut e)?;
            } else {
                self.c.set_one_ret(&mut e); // close the last expression
                return self.c.store_var(&lhs[level], &mut e); // avoid default
            }
        }
        self.c.store_var_top(&lhs[level]) // default assignment
    }

    /// Adjust `nexps` produced values to `nvars` consumers.
    fn adjust_values(&mut self, nvars: usize, nexps: usize, e: &mut ExpDesc) -> LunaResult<()> {
        let needed = nvars as i32 - nexps as i32; // extra values needed
        if e.has_multret() {
            // the last expression provides the difference
            let extra = (needed + 1).max(0);
            self.c.set_returns(e, extra)?;
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.c.exp_to_next_reg(e)?; // close the last expression
            }
            if needed > 0 {
                // missing values: complete with nils
                let freereg = self.c.fs().freereg;
                self.c.nil(freereg, needed as u32)?;
            }
        }
        if needed > 0 {
            self.c.reserve_regs(needed as u32)?;
        } else {
            // adding 'needed' removes the extra values
            let fs = self.c.fs_mut();
            fs.freereg = (fs.freereg as i32 + needed) as u32;
        }
        Ok(())
    }

    fn cond(&mut self) -> LunaResult<i32> {
        // cond -> exp
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        if matches!(v.kind, ExpKind::Nil) {
            v.set(ExpKind::False); // all 'falses' are equal here
        }
        self.c.go_if_true(&mut v)?;
        Ok(v.f)
    }

    fn goto_stat(&mut self, line: u32) -> LunaResult<()> {
        let name = self.check_name()?; // label's name
        self.c.new_goto_entry(name, line)
    }

    /// Break is a goto to the synthetic `break` label of the innermost
    /// loop.
    fn break_stat(&mut self, line: u32) -> LunaResult<()> {
        if !self.c.mark_break_target() {
            return Err(self.lex.syntax_error("break outside loop"));
        }
        self.next()?; // skip 'break'
        self.c.new_goto_entry(break_label_name(), line)
    }

    fn label_stat(&mut self, name: LuaStr, line: u32) -> LunaResult<()> {
        // label -> '::' NAME '::'
        self.check_next(&Token::DbColon)?; // skip the second double colon
        while self.tok().is_char(b';') || matches!(self.tok(), Token::DbColon) {
            self.statement()?; // skip other no-op statements
        }
        if let Some(prev_line) = self.c.find_repeated_label(&name) {
            return Err(self.c.sem_error(&format!(
                "label '{}' already defined on line {}",
                name.display(),
                prev_line
            )));
        }
        let last = self.block_follow(false);
        self.c.create_label(name, line, last)
    }

    fn while_stat(&mut self, line: u32) -> LunaResult<()> {
        // whilestat -> WHILE cond DO block END
        self.next()?; // skip WHILE
        let while_init = self.c.get_label();
        let cond_exit = self.cond()?;
        self.c.enter_block(BL_LOOP);
        self.check_next(&Token::Do)?;
        self.block()?;
        let back = self.c.jump()?;
        self.c.patch_list(back, while_init)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.c.leave_block()?;
        self.c.patch_to_here(cond_exit)?; // false conditions finish the loop
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> LunaResult<()> {
        // repeatstat -> REPEAT block UNTIL cond
        let repeat_init = self.c.get_label();
        self.c.enter_block(BL_LOOP); // loop block
        self.c.enter_block(BL_NOT_LOOP); // scope block
        self.next()?; // skip REPEAT
        self.statlist()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        let mut cond_exit = self.cond()?; // read condition (inside scope block)
        let scope_upval = self.c.fs().block().upval;
        let scope_nactvar = self.c.fs().block().nactvar;
        self.c.leave_block()?; // finish scope
        if scope_upval {
            // upvalues: the repetition must close them
            let exit = self.c.jump()?; // normal exit jumps over the fix
            self.c.patch_to_here(cond_exit)?;
            let level = self.c.reg_level(scope_nactvar);
            self.c.code_abc(OpCode::Close, level, 0, 0)?;
            cond_exit = self.c.jump()?; // repeat after closing upvalues
            self.c.patch_to_here(exit)?; // normal exit comes here
        }
        self.c.patch_list(cond_exit, repeat_init)?; // close the loop
        self.c.leave_block() // finish loop
    }

    /// Read an expression and put its single result in the next slot.
    fn exp1(&mut self) -> LunaResult<()> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        self.c.exp_to_next_reg(&mut e)?;
        debug_assert!(matches!(e.kind, ExpKind::NonReloc(_)));
        Ok(())
    }

    /// `forbody -> DO block`, shared by both for forms.
    fn for_body(&mut self, base: u32, line: u32, nvars: usize, is_gen: bool) -> LunaResult<()> {
        self.check_next(&Token::Do)?;
        let prep_op = if is_gen { OpCode::TForPrep } else { OpCode::ForPrep };
        let loop_op = if is_gen { OpCode::TForLoop } else { OpCode::ForLoop };
        let prep = self.c.code_abx(prep_op, base, 0)?;
        self.c.enter_block(BL_NOT_LOOP); // scope for declared variables
        self.c.adjust_local_vars(nvars)?;
        self.c.reserve_regs(nvars as u32)?;
        self.block()?;
        self.c.leave_block()?; // end of scope for declared variables
        let here = self.c.get_label();
        self.c.fix_for_jump(prep, here, false)?;
        if is_gen {
            // generic for: call the iterator
            self.c.code_abc(OpCode::TForCall, base, 0, nvars as u32)?;
            self.c.fix_line(line);
        }
        let endfor = self.c.code_abx(loop_op, base, 0)?;
        self.c.fix_for_jump(endfor, prep + 1, true)?;
        self.c.fix_line(line);
        Ok(())
    }

    fn for_num(&mut self, varname: LuaStr, line: u32) -> LunaResult<()> {
        // fornum -> NAME = exp,exp[,exp] forbody
        let base = self.c.fs().freereg;
        let state = self.lex.intern_str("(for state)");
        self.c.new_local_var(state.clone());
        self.c.new_local_var(state.clone());
        self.c.new_local_var(state);
        self.c.new_var_kind(Some(varname), var_kind::RDKCONST); // control variable
        self.check_next(&Token::Char(b'='))?;
        self.exp1()?; // initial value
        self.check_next(&Token::Char(b','))?;
        self.exp1()?; // limit
        if self.test_next(&Token::Char(b','))? {
            self.exp1()?; // optional step
        } else {
            // default step = 1
            let freereg = self.c.fs().freereg;
            self.c.code_int(freereg, 1)?;
            self.c.reserve_regs(1)?;
        }
        self.c.adjust_local_vars(3)?; // scope for internal variables
        self.for_body(base, line, 1, false)
    }

    fn for_list(&mut self, index_name: LuaStr) -> LunaResult<()> {
        // forlist -> NAME {,NAME} IN explist forbody
        let base = self.c.fs().freereg;
        // internal state: iterator function, state, control, closing
        let state = self.lex.intern_str("(for state)");
        self.c.new_local_var(state.clone());
        self.c.new_local_var(state.clone());
        self.c.new_local_var(state.clone());
        self.c.new_local_var(state);
        // declared variables
        self.c.new_local_var(index_name);
        let mut nvars = 5usize;
        while self.test_next(&Token::Char(b','))? {
            let name = self.check_name()?;
            self.c.new_local_var(name);
            nvars += 1;
        }
        self.check_next(&Token::In)?;
        let line = self.lex.line_number();
        let mut e = ExpDesc::void();
        let nexps = self.explist(&mut e)?;
        self.adjust_values(4, nexps, &mut e)?;
        self.c.adjust_local_vars(4)?; // internal variables
        self.c.mark_to_be_closed(); // the closing slot must be closed
        self.c.check_stack(3)?; // extra space to call the iterator
        self.for_body(base, line, nvars - 4, true)
    }

    fn for_stat(&mut self, line: u32) -> LunaResult<()> {
        // forstat -> FOR (fornum | forlist) END
        self.c.enter_block(BL_LOOP); // scope for loop and control variables
        self.next()?; // skip 'for'
        let varname = self.check_name()?; // first variable name
        match self.tok() {
            Token::Char(b'=') => self.for_num(varname, line)?,
            Token::Char(b',') | Token::In => self.for_list(varname)?,
            _ => return Err(self.lex.syntax_error("'=' or 'in' expected")),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.c.leave_block() // loop scope ('break' jumps to this point)
    }

    fn test_then_block(&mut self, escape_list: &mut i32) -> LunaResult<()> {
        // test_then_block -> [IF | ELSEIF] cond THEN block
        self.next()?; // skip IF or ELSEIF
        let cond_true = self.cond()?;
        self.check_next(&Token::Then)?;
        self.block()?; // 'then' part
        if matches!(self.tok(), Token::Else | Token::Elseif) {
            // must jump over the rest
            let j = self.c.jump()?;
            self.c.concat_jumps(escape_list, j)?;
        }
        self.c.patch_to_here(cond_true)
    }

    fn if_stat(&mut self, line: u32) -> LunaResult<()> {
        // ifstat -> IF cond THEN block {ELSEIF cond THEN block}
        //           [ELSE block] END
        let mut escape_list = NO_JUMP; // exit list for finished parts
        self.test_then_block(&mut escape_list)?;
        while matches!(self.tok(), Token::Elseif) {
            self.test_then_block(&mut escape_list)?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?; // 'else' part
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.c.patch_to_here(escape_list) // patch escapes to the 'if' end
    }

    fn local_func(&mut self) -> LunaResult<()> {
        let fvar = self.c.fs().nactvar; // function's variable index
        let name = self.check_name()?;
        self.c.new_local_var(name); // new local variable
        self.c.adjust_local_vars(1)?; // enter its scope
        let line = self.lex.line_number();
        self.body(false, line)?; // the closure lands in the new register
        // debug information only sees the variable after this point
        let pc = self.c.pc();
        if let Some(lv) = self.c.local_debug_info(fvar) {
            lv.start_pc = pc;
        }
        Ok(())
    }

    /// `attrib -> ['<' NAME '>']`; returns the variable kind.
    fn get_var_attribute(&mut self, default: u8) -> LunaResult<u8> {
        if self.test_next(&Token::Char(b'<'))? {
            let attr = self.check_name()?;
            self.check_next(&Token::Char(b'>'))?;
            match attr.as_bytes() {
                b"const" => return Ok(var_kind::RDKCONST), // read-only variable
                b"close" => return Ok(var_kind::RDKTOCLOSE), // to-be-closed variable
                _ => {
                    return Err(self
                        .c
                        .sem_error(&format!("unknown attribute '{}'", attr.display())))
                }
            }
        }
        Ok(default)
    }

    fn local_stat(&mut self) -> LunaResult<()> {
        // stat -> LOCAL NAME attrib { ',' NAME attrib } ['=' explist]
        let mut toclose = -1i32; // index of the to-be-closed variable, if any
        let mut nvars = 0usize;
        let mut vidx = 0u16; // index of the last variable
        // prefixed attribute applies to the whole list by default
        let defkind = self.get_var_attribute(var_kind::VDKREG)?;
        loop {
            let vname = self.check_name()?;
            let kind = self.get_var_attribute(defkind)?; // postfixed attribute
            vidx = self.c.new_var_kind(Some(vname), kind); // predeclare
            if kind == var_kind::RDKTOCLOSE {
                if toclose != -1 {
                    // one already present
                    return Err(self
                        .c
                        .sem_error("multiple to-be-closed variables in local list"));
                }
                toclose = (self.c.fs().nactvar as usize + nvars) as i32;
            }
            nvars += 1;
            if !self.test_next(&Token::Char(b','))? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let nexps = if self.test_next(&Token::Char(b'='))? {
            self.explist(&mut e)?
        } else {
            0
        };
        let last_kind = self.c.local_var(vidx).kind;
        let ctc_value = if nvars == nexps && last_kind == var_kind::RDKCONST {
            self.c.exp_to_const(&e) // compile-time constant?
        } else {
            None
        };
        if let Some(v) = ctc_value {
            // the last variable becomes a compile-time constant with no
            // register of its own
            let var = self.c.local_var_mut(vidx);
            var.kind = var_kind::RDKCTC;
            var.k = v;
            self.c.adjust_local_vars(nvars - 1)?; // exclude the last variable
            self.c.fs_mut().nactvar += 1; // but count it
        } else {
            self.adjust_values(nvars, nexps, &mut e)?;
            self.c.adjust_local_vars(nvars)?;
        }
        self.c.check_to_close(toclose)
    }

    fn get_global_attribute(&mut self, default: u8) -> LunaResult<u8> {
        let kind = self.get_var_attribute(default)?;
        match kind {
            var_kind::RDKTOCLOSE => {
                Err(self.c.sem_error("global variables cannot be to-be-closed"))
            }
            var_kind::RDKCONST => Ok(var_kind::GDKCONST),
            _ => Ok(kind),
        }
    }

    fn global_names(&mut self, defkind: u8) -> LunaResult<()> {
        let mut nvars = 0usize;
        let mut lastidx = 0u16; // index of the last registered name
        loop {
            let vname = self.check_name()?;
            let kind = self.get_global_attribute(defkind)?;
            lastidx = self.c.new_var_kind(Some(vname), kind);
            nvars += 1;
            if !self.test_next(&Token::Char(b','))? {
                break;
            }
        }
        if self.test_next(&Token::Char(b'='))? {
            let mut e = ExpDesc::void();
            let nexps = self.explist(&mut e)?;
            self.adjust_values(nvars, nexps, &mut e)?;
            for i in 0..nvars {
                let varname = self
                    .c
                    .local_var(lastidx - i as u16)
                    .name
                    .clone()
                    .expect("global declaration has a name");
                let mut var = ExpDesc::void();
                self.build_global(&varname, &mut var)?;
                self.c.store_var_top(&var)?;
            }
        }
        self.c.fs_mut().nactvar += nvars as u16; // activate the declaration
        Ok(())
    }

    fn global_stat(&mut self) -> LunaResult<()> {
        // globalstat -> (GLOBAL) attrib '*'
        // globalstat -> (GLOBAL) attrib NAME attrib {',' NAME attrib}
        let defkind = self.get_global_attribute(var_kind::GDKREG)?;
        if !self.test_next(&Token::Char(b'*'))? {
            self.global_names(defkind)
        } else {
            // a collective declaration, represented by a nameless entry
            self.c.new_var_kind(None, defkind);
            self.c.fs_mut().nactvar += 1;
            Ok(())
        }
    }

    fn global_func(&mut self, line: u32) -> LunaResult<()> {
        // globalfunc -> (GLOBAL FUNCTION) NAME body
        let fname = self.check_name()?;
        self.c.new_var_kind(Some(fname.clone()), var_kind::GDKREG);
        self.c.fs_mut().nactvar += 1; // enter its scope
        let mut var = ExpDesc::void();
        self.build_global(&fname, &mut var)?;
        let body_line = self.lex.line_number();
        let mut b = self.body(false, body_line)?;
        self.c.store_var(&var, &mut b)?;
        self.c.fix_line(line); // definition "happens" in the first line
        Ok(())
    }

    fn global_stat_func(&mut self, line: u32) -> LunaResult<()> {
        // stat -> GLOBAL globalfunc | GLOBAL globalstat
        self.next()?; // skip 'global'
        if self.test_next(&Token::Function)? {
            self.global_func(line)
        } else {
            self.global_stat()
        }
    }

    fn func_name(&mut self, v: &mut ExpDesc) -> LunaResult<bool> {
        // funcname -> NAME {fieldsel} [':' NAME]
        let mut is_method = false;
        self.single_var(v)?;
        while self.tok().is_char(b'.') {
            self.field_sel(v)?;
        }
        if self.tok().is_char(b':') {
            is_method = true;
            self.field_sel(v)?;
        }
        Ok(is_method)
    }

    fn func_stat(&mut self, line: u32) -> LunaResult<()> {
        // funcstat -> FUNCTION funcname body
        self.next()?; // skip FUNCTION
        let mut v = ExpDesc::void();
        let is_method = self.func_name(&mut v)?;
        self.check_readonly(&v)?;
        let mut b = self.body(is_method, line)?;
        self.c.store_var(&v, &mut b)?;
        self.c.fix_line(line); // definition "happens" in the first line
        Ok(())
    }

    fn expr_stat(&mut self) -> LunaResult<()> {
        // stat -> func | assignment
        let mut v = ExpDesc::void();
        self.suffixed_exp(&mut v)?;
        if self.tok().is_char(b'=') || self.tok().is_char(b',') {
            // stat -> assignment
            let mut lhs = vec![v];
            self.rest_assign(&mut lhs, 0)
        } else {
            // stat -> func
            self.check_condition(matches!(v.kind, ExpKind::Call(_)), "syntax error")?;
            let pc = v.pc();
            self.c.instr_mut(pc).set_c(1); // call statement uses no results
            Ok(())
        }
    }

    fn ret_stat(&mut self) -> LunaResult<()> {
        // stat -> RETURN [explist] [';']
        let mut first = self.c.nvar_stack(); // first slot to be returned
        let nret: i32;
        if self.block_follow(true) || self.tok().is_char(b';') {
            nret = 0; // return no values
        } else {
            let mut e = ExpDesc::void();
            let n = self.explist(&mut e)?; // optional return values
            if e.has_multret() {
                self.c.set_returns(&e, MULTRET)?;
                if let ExpKind::Call(pc) = e.kind {
                    // tail call, unless inside a to-be-closed scope
                    if n == 1 && !self.c.inside_tbc() {
                        self.c.instr_mut(pc).set_opcode(OpCode::TailCall);
                        debug_assert_eq!(self.c.instr(pc).a(), self.c.nvar_stack());
                    }
                }
                nret = MULTRET; // return all values
            } else if n == 1 {
                first = self.c.exp_to_any_reg(&mut e)?; // can use the original slot
                nret = 1;
            } else {
                // values must go to the top of the stack
                self.c.exp_to_next_reg(&mut e)?;
                nret = n as i32;
                debug_assert_eq!(nret, (self.c.fs().freereg - first) as i32);
            }
        }
        self.c.ret(first, nret)?;
        self.test_next(&Token::Char(b';'))?; // skip optional semicolon
        Ok(())
    }

    fn statement(&mut self) -> LunaResult<()> {
        let line = self.lex.line_number(); // may be needed for error messages
        self.enter_level()?;
        match self.tok().clone() {
            Token::Char(b';') => {
                self.next()?; // skip ';'
            }
            Token::If => {
                self.if_stat(line)?;
            }
            Token::While => {
                self.while_stat(line)?;
            }
            Token::Do => {
                self.next()?; // skip DO
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => {
                self.for_stat(line)?;
            }
            Token::Repeat => {
                self.repeat_stat(line)?;
            }
            Token::Function => {
                self.func_stat(line)?;
            }
            Token::Local => {
                self.next()?; // skip LOCAL
                if self.test_next(&Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::Global => {
                self.global_stat_func(line)?;
            }
            Token::DbColon => {
                self.next()?; // skip the double colon
                let name = self.check_name()?;
                self.label_stat(name, line)?;
            }
            Token::Return => {
                self.next()?; // skip RETURN
                self.ret_stat()?;
            }
            Token::Break => {
                self.break_stat(line)?;
            }
            Token::Goto => {
                self.next()?; // skip 'goto'
                self.goto_stat(line)?;
            }
            _ => {
                self.expr_stat()?;
            }
        }
        debug_assert!(
            self.c.fs().proto.max_stack_size as u32 >= self.c.fs().freereg
                && self.c.fs().freereg >= self.c.nvar_stack()
        );
        let nvars = self.c.nvar_stack();
        self.c.fs_mut().freereg = nvars; // free registers
        self.leave_level();
        Ok(())
    }

    /// Compile the main function: a vararg function with one upvalue
    /// named `_ENV`.
    fn main_func(&mut self) -> LunaResult<Closure> {
        let source = self.lex.source().clone();
        self.c.open_func(Some(source), 0);
        self.c.set_vararg(0)?; // the main function is always vararg
        self.c.fs_mut().proto.upvalues.push(UpvalDesc {
            name: Some(self.env_name.clone()),
            in_stack: true,
            index: 0,
            kind: var_kind::VDKREG,
        });
        self.next()?; // read the first token
        self.statlist()?; // parse the main body
        self.check(&Token::Eos)?;
        let proto = self.c.close_func()?;
        debug_assert!(self.c.fs_stack.is_empty());
        debug_assert!(self.c.dyd.actvar.is_empty() && self.c.dyd.gt.is_empty());
        log::debug!(
            "compiled chunk: {} instructions, {} child functions",
            proto.code.len(),
            proto.protos.len()
        );
        Ok(Closure::new(proto))
    }
}

pub use data_structure::{FxHashMap, FxHashSet};

use session::{CompilerOption, Session};
use ty::TypeContext;

/// Everything a pass may consult besides the function it rewrites.
pub struct GlobalContext<'ctx> {
    types: &'ctx TypeContext,
    session: Session,
}

impl<'ctx> GlobalContext<'ctx> {
    pub fn new(types: &'ctx TypeContext, session: Session) -> Self {
        Self { types, session }
    }

    pub fn types(&self) -> &'ctx TypeContext {
        self.types
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn options(&self) -> &CompilerOption {
        &self.session.compiler_option
    }
}
